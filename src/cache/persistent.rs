//! Persistent Layer Module
//!
//! Best-effort, size-budgeted serialized store behind the in-memory layer.
//! Backend failures are logged and read as misses; capacity is made by
//! evicting the oldest writes and never reported as an error.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::cache::CacheEntry;
use crate::clock::SharedClock;
use crate::error::{DataError, Result};

// == Storage Backend ==
/// Key/value string storage, in the shape of browser local storage.
pub trait StorageBackend: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str) -> Result<()>;
    fn keys(&self) -> Result<Vec<String>>;
}

// == Memory Storage ==
/// Process-local backend.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.items.lock().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        self.items.lock().remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.items.lock().keys().cloned().collect())
    }
}

// == Directory Storage ==
/// One file per key in a directory; survives restarts.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    dir: PathBuf,
}

impl DirectoryStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Path for `key`, and whether its name is a digest rather than the key.
    fn path_for(&self, key: &str) -> (PathBuf, bool) {
        let name = encode_file_name(key);
        let hashed = is_hashed_name(&name);
        (self.dir.join(name), hashed)
    }
}

impl StorageBackend for DirectoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let (path, hashed) = self.path_for(key);
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if !hashed {
            return Ok(Some(contents));
        }
        Ok(split_key_header(&contents)
            .filter(|(stored, _)| stored == key)
            .map(|(_, value)| value.to_string()))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let (path, hashed) = self.path_for(key);
        if hashed {
            let header = serde_json::to_string(key)?;
            fs::write(path, format!("{}\n{}", header, value))?;
        } else {
            fs::write(path, value)?;
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key).0) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in fs::read_dir(&self.dir)? {
            let item = item?;
            let Some(name) = item.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if is_hashed_name(&name) {
                let contents = fs::read_to_string(item.path())?;
                if let Some((key, _)) = split_key_header(&contents) {
                    keys.push(key);
                }
            } else if let Some(key) = decode_file_name(&name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

/// Longest file name common filesystems accept.
const MAX_FILE_NAME: usize = 255;
/// Escaped key bytes kept in front of the digest of a long key.
const HASHED_PREFIX: usize = 64;
/// Separates the readable prefix from the digest; never produced by escaping.
const DIGEST_MARK: char = '~';

/// Keys carry `|`, `:` and `,`; everything outside `[A-Za-z0-9-]` is hex escaped.
/// A name that would run past the filesystem limit becomes a prefix of the
/// escaped key plus its SHA-256, and the file then carries the key itself.
fn encode_file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("_{:02x}", byte));
        }
    }

    if name.len() + ".json".len() > MAX_FILE_NAME {
        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        name.truncate(HASHED_PREFIX);
        name.push(DIGEST_MARK);
        name.push_str(&hex::encode(hasher.finalize()));
    }
    name.push_str(".json");
    name
}

fn is_hashed_name(name: &str) -> bool {
    name.contains(DIGEST_MARK)
}

fn decode_file_name(name: &str) -> Option<String> {
    let stem = name.strip_suffix(".json")?;
    let mut bytes = Vec::with_capacity(stem.len());
    let mut chars = stem.bytes();
    while let Some(b) = chars.next() {
        if b == b'_' {
            let hi = chars.next()? as char;
            let lo = chars.next()? as char;
            bytes.push(u8::from_str_radix(&format!("{}{}", hi, lo), 16).ok()?);
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes).ok()
}

/// Splits a hashed file into the key it holds and the stored value.
fn split_key_header(contents: &str) -> Option<(String, &str)> {
    let (header, value) = contents.split_once('\n')?;
    let key = serde_json::from_str(header).ok()?;
    Some((key, value))
}

// == Persisted Entry ==
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry<T> {
    written_at: u64,
    ttl_ms: u64,
    data: T,
}

#[derive(Debug, Default)]
struct BudgetIndex {
    /// key -> (written_at, bytes)
    items: HashMap<String, (u64, usize)>,
    used_bytes: usize,
}

impl BudgetIndex {
    fn insert(&mut self, key: &str, written_at: u64, bytes: usize) {
        self.remove(key);
        self.items.insert(key.to_string(), (written_at, bytes));
        self.used_bytes += bytes;
    }

    fn remove(&mut self, key: &str) {
        if let Some((_, bytes)) = self.items.remove(key) {
            self.used_bytes -= bytes;
        }
    }

    fn oldest(&self) -> Option<String> {
        self.items
            .iter()
            .min_by(|a, b| a.1 .0.cmp(&b.1 .0).then_with(|| a.0.cmp(b.0)))
            .map(|(k, _)| k.clone())
    }
}

/// Usage snapshot for diagnostics.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PersistentStats {
    pub entries: usize,
    pub used_bytes: usize,
    pub budget_bytes: usize,
}

// == Persistent Layer ==
pub struct PersistentLayer {
    backend: Box<dyn StorageBackend>,
    prefix: String,
    budget_bytes: usize,
    index: Mutex<BudgetIndex>,
    clock: SharedClock,
}

impl PersistentLayer {
    /// Opens the layer over `backend`, indexing whatever a previous session
    /// left under `prefix`.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        prefix: impl Into<String>,
        budget_bytes: usize,
        clock: SharedClock,
    ) -> Self {
        let layer = Self {
            backend,
            prefix: prefix.into(),
            budget_bytes,
            index: Mutex::new(BudgetIndex::default()),
            clock,
        };
        layer.rebuild_index();
        layer
    }

    fn rebuild_index(&self) {
        let keys = match self.backend.keys() {
            Ok(keys) => keys,
            Err(err) => {
                warn!(error = %err, "Persistent layer unavailable, starting empty");
                return;
            }
        };

        let mut index = self.index.lock();
        for storage_key in keys.into_iter().filter(|k| k.starts_with(&self.prefix)) {
            let raw = match self.backend.get_item(&storage_key) {
                Ok(Some(raw)) => raw,
                _ => continue,
            };
            match serde_json::from_str::<PersistedEntry<serde_json::Value>>(&raw) {
                Ok(entry) => {
                    let key = storage_key[self.prefix.len()..].to_string();
                    index.insert(&key, entry.written_at, raw.len());
                }
                Err(_) => {
                    let _ = self.backend.remove_item(&storage_key);
                }
            }
        }
        if !index.items.is_empty() {
            info!(
                entries = index.items.len(),
                used_bytes = index.used_bytes,
                "Persistent layer restored"
            );
        }
    }

    fn storage_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    // == Read ==
    /// Returns the entry if present, decodable and unexpired.
    pub fn read<T>(&self, key: &str) -> Option<CacheEntry<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        match self.try_read(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key, error = %err, "Persistent read failed, treating as miss");
                None
            }
        }
    }

    fn try_read<T>(&self, key: &str) -> Result<Option<CacheEntry<T>>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let Some(raw) = self.backend.get_item(&self.storage_key(key))? else {
            return Ok(None);
        };
        let persisted: PersistedEntry<T> = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(err) => {
                self.remove(key);
                return Err(DataError::CacheLayer(format!("corrupt entry: {}", err)));
            }
        };

        let entry = CacheEntry {
            key: key.to_string(),
            data: persisted.data,
            written_at: persisted.written_at,
            ttl_ms: persisted.ttl_ms,
        };
        if entry.is_expired_at(self.clock.now_ms()) {
            debug!(key, "Persistent entry expired");
            self.remove(key);
            return Ok(None);
        }
        Ok(Some(entry))
    }

    // == Write ==
    /// Stores `data` under `key`, evicting oldest writes until it fits.
    /// Returns false if nothing was stored.
    pub fn write<T: Serialize>(&self, key: &str, data: &T, written_at: u64, ttl_ms: u64) -> bool {
        let persisted = PersistedEntry {
            written_at,
            ttl_ms,
            data,
        };
        let raw = match serde_json::to_string(&persisted) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(key, error = %err, "Persistent encode failed");
                return false;
            }
        };

        if raw.len() > self.budget_bytes {
            debug!(
                key,
                bytes = raw.len(),
                budget = self.budget_bytes,
                "Entry larger than persistent budget, skipped"
            );
            return false;
        }

        let mut index = self.index.lock();
        index.remove(key);
        while index.used_bytes + raw.len() > self.budget_bytes {
            let Some(oldest) = index.oldest() else { break };
            if let Err(err) = self.backend.remove_item(&self.storage_key(&oldest)) {
                warn!(key = %oldest, error = %err, "Persistent evict failed");
            }
            index.remove(&oldest);
            debug!(key = %oldest, "Evicted from persistent layer");
        }

        match self.backend.set_item(&self.storage_key(key), &raw) {
            Ok(()) => {
                index.insert(key, written_at, raw.len());
                true
            }
            Err(err) => {
                warn!(key, error = %err, "Persistent write failed");
                false
            }
        }
    }

    pub fn remove(&self, key: &str) {
        if let Err(err) = self.backend.remove_item(&self.storage_key(key)) {
            warn!(key, error = %err, "Persistent remove failed");
        }
        self.index.lock().remove(key);
    }

    pub fn stats(&self) -> PersistentStats {
        let index = self.index.lock();
        PersistentStats {
            entries: index.items.len(),
            used_bytes: index.used_bytes,
            budget_bytes: self.budget_bytes,
        }
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct BrokenStorage;

    impl StorageBackend for BrokenStorage {
        fn get_item(&self, _key: &str) -> Result<Option<String>> {
            Err(DataError::CacheLayer("quota".into()))
        }
        fn set_item(&self, _key: &str, _value: &str) -> Result<()> {
            Err(DataError::CacheLayer("quota".into()))
        }
        fn remove_item(&self, _key: &str) -> Result<()> {
            Err(DataError::CacheLayer("quota".into()))
        }
        fn keys(&self) -> Result<Vec<String>> {
            Err(DataError::CacheLayer("quota".into()))
        }
    }

    fn layer(budget: usize) -> (Arc<ManualClock>, PersistentLayer) {
        let clock = Arc::new(ManualClock::new(0));
        let layer = PersistentLayer::open(Box::new(MemoryStorage::new()), "sc:", budget, clock.clone());
        (clock, layer)
    }

    #[test]
    fn test_write_then_read() {
        let (_, layer) = layer(10_000);
        assert!(layer.write("a", &vec![1, 2, 3], 0, 1_000));

        let entry: CacheEntry<Vec<u32>> = layer.read("a").unwrap();
        assert_eq!(entry.data, vec![1, 2, 3]);
        assert_eq!(entry.written_at, 0);
    }

    #[test]
    fn test_expired_entry_is_a_miss_and_removed() {
        let (clock, layer) = layer(10_000);
        layer.write("a", &1u32, 0, 1_000);

        clock.advance(1_000);
        assert!(layer.read::<u32>("a").is_none());
        assert_eq!(layer.stats().entries, 0);
    }

    #[test]
    fn test_budget_evicts_oldest_first() {
        let (_, layer) = layer(120);
        let value = "x".repeat(30);

        layer.write("first", &value.clone(), 1, 60_000);
        layer.write("second", &value.clone(), 2, 60_000);
        layer.write("third", &value.clone(), 3, 60_000);

        assert!(layer.read::<String>("first").is_none());
        assert!(layer.read::<String>("third").is_some());
        assert!(layer.stats().used_bytes <= 120);
    }

    #[test]
    fn test_oversized_entry_skipped() {
        let (_, layer) = layer(50);
        assert!(!layer.write("big", &"y".repeat(200), 0, 60_000));
        assert_eq!(layer.stats().entries, 0);
    }

    #[test]
    fn test_broken_backend_degrades_to_miss() {
        let clock = Arc::new(ManualClock::new(0));
        let layer = PersistentLayer::open(Box::new(BrokenStorage), "sc:", 1_000, clock);

        assert!(!layer.write("a", &1u32, 0, 1_000));
        assert!(layer.read::<u32>("a").is_none());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let clock = Arc::new(ManualClock::new(0));
        let storage = MemoryStorage::new();
        storage.set_item("sc:bad", "{not json").unwrap();
        let layer = PersistentLayer::open(Box::new(storage), "sc:", 1_000, clock);

        assert!(layer.read::<u32>("bad").is_none());
    }

    #[test]
    fn test_file_name_round_trip() {
        let key = "readings|range=30d|res=auto#S1";
        let name = encode_file_name(key);
        assert!(!name.contains('|'));
        assert_eq!(decode_file_name(&name).as_deref(), Some(key));
    }

    #[test]
    fn test_directory_storage_restores_index() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        {
            let backend = DirectoryStorage::open(dir.path()).unwrap();
            let layer = PersistentLayer::open(Box::new(backend), "sc:", 10_000, clock.clone());
            layer.write("k|1", &9u32, 0, 5_000);
        }

        let backend = DirectoryStorage::open(dir.path()).unwrap();
        let layer = PersistentLayer::open(Box::new(backend), "sc:", 10_000, clock);
        assert_eq!(layer.stats().entries, 1);
        assert_eq!(layer.read::<u32>("k|1").map(|e| e.data), Some(9));
    }

    #[test]
    fn test_long_key_gets_hashed_file_name() {
        let sites: Vec<String> = (0..200).map(|i| format!("SITE-{:03}", i)).collect();
        let key = format!("readings|sites={}|range=1y", sites.join(","));
        let name = encode_file_name(&key);

        assert!(name.len() <= MAX_FILE_NAME);
        assert!(is_hashed_name(&name));
        assert_ne!(name, encode_file_name(&format!("{}X", key)));
    }

    #[test]
    fn test_directory_storage_round_trips_long_keys() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let sites: Vec<String> = (0..200).map(|i| format!("SITE-{:03}", i)).collect();
        let key = format!("entity-data|{}#S1", sites.join(","));
        {
            let backend = DirectoryStorage::open(dir.path()).unwrap();
            let layer = PersistentLayer::open(Box::new(backend), "sc:", 10_000, clock.clone());
            assert!(layer.write(&key, &7u32, 0, 5_000));
            assert_eq!(layer.read::<u32>(&key).map(|e| e.data), Some(7));
        }

        let backend = DirectoryStorage::open(dir.path()).unwrap();
        assert_eq!(backend.keys().unwrap(), vec![format!("sc:{}", key)]);
        let layer = PersistentLayer::open(Box::new(backend), "sc:", 10_000, clock);
        assert_eq!(layer.stats().entries, 1);
        assert_eq!(layer.read::<u32>(&key).map(|e| e.data), Some(7));

        layer.remove(&key);
        assert!(fs::read_dir(dir.path()).unwrap().next().is_none());
    }
}
