//! Data models
//!
//! Wire blocks as the backend sends them, and the normalized row form every
//! component past the cache boundary works with.

use std::collections::BTreeMap;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Column names that carry identity rather than readings.
const SITE_FIELDS: [&str; 3] = ["site_id", "site", "siteId"];
const TIME_FIELDS: [&str; 3] = ["timestamp", "ts", "time"];

// == Row ==
/// One normalized reading row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub site_id: String,
    /// Unix milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

// == Raw Block ==
/// Payload shapes the backend may answer with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "data", rename_all = "lowercase")]
pub enum RawBlock {
    Rows(Vec<Map<String, Value>>),
    Columnar(BTreeMap<String, Vec<Value>>),
}

impl RawBlock {
    /// Number of records carried, independent of shape.
    pub fn len(&self) -> usize {
        match self {
            RawBlock::Rows(rows) => rows.len(),
            RawBlock::Columnar(columns) => columns.values().map(Vec::len).max().unwrap_or(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves the block into rows tagged with `entity`.
    ///
    /// Any site field in the payload is ignored: rows always belong to the
    /// entity that requested them. Records without a readable timestamp are
    /// dropped.
    pub fn into_rows(self, entity: &str) -> Vec<Row> {
        let records: Vec<Map<String, Value>> = match self {
            RawBlock::Rows(rows) => rows,
            RawBlock::Columnar(columns) => pivot_columns(columns),
        };

        let total = records.len();
        let rows: Vec<Row> = records
            .into_iter()
            .filter_map(|record| normalize_record(record, entity))
            .collect();

        if rows.len() < total {
            debug!(entity, dropped = total - rows.len(), "Dropped rows without timestamp");
        }
        rows
    }
}

fn pivot_columns(columns: BTreeMap<String, Vec<Value>>) -> Vec<Map<String, Value>> {
    let len = columns.values().map(Vec::len).max().unwrap_or(0);
    let mut records = vec![Map::new(); len];
    for (name, values) in columns {
        for (record, value) in records.iter_mut().zip(values) {
            record.insert(name.clone(), value);
        }
    }
    records
}

fn normalize_record(record: Map<String, Value>, entity: &str) -> Option<Row> {
    let timestamp = TIME_FIELDS
        .iter()
        .find_map(|field| record.get(*field).and_then(parse_timestamp))?;

    let values = record
        .iter()
        .filter(|(name, _)| {
            !SITE_FIELDS.contains(&name.as_str()) && !TIME_FIELDS.contains(&name.as_str())
        })
        .filter_map(|(name, value)| parse_number(value).map(|n| (name.clone(), n)))
        .collect();

    Some(Row {
        site_id: entity.to_string(),
        timestamp,
        values,
    })
}

fn parse_timestamp(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| t.timestamp_millis())
            .ok()
            .or_else(|| s.parse().ok()),
        _ => None,
    }
}

fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// == Entity Data ==
/// Everything cached for one entity over one canonical range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityData {
    pub entity: String,
    pub rows: Vec<Row>,
    /// Record count the backend declared, if it declared one
    pub total_records: Option<u64>,
}

// == Cache Outcome ==
/// How a load was served.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheOutcome {
    /// Every entity came from cache; no network call was made
    Complete,
    Partial {
        cached: Vec<String>,
        fetched: Vec<String>,
    },
    Miss,
}

// == Loaded Data ==
/// Merged result of a logical load.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadedData {
    /// Canonical key of the request
    pub key: String,
    pub rows: Vec<Row>,
    pub metadata: LoadMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadMetadata {
    /// Rows per entity after merge
    pub per_entity: BTreeMap<String, usize>,
    /// Sum of backend-declared totals, when every entity declared one
    pub total_records: Option<u64>,
    pub cache: CacheOutcome,
}

impl LoadedData {
    /// Merges per-entity data in entity order, then by timestamp.
    pub fn merge(key: String, parts: Vec<std::sync::Arc<EntityData>>, cache: CacheOutcome) -> Self {
        let mut parts = parts;
        parts.sort_by(|a, b| a.entity.cmp(&b.entity));

        let per_entity = parts
            .iter()
            .map(|p| (p.entity.clone(), p.rows.len()))
            .collect();
        let total_records = parts
            .iter()
            .map(|p| p.total_records)
            .sum::<Option<u64>>();

        let mut rows: Vec<Row> = parts.iter().flat_map(|p| p.rows.iter().cloned()).collect();
        rows.sort_by_key(|r| r.timestamp);

        Self {
            key,
            rows,
            metadata: LoadMetadata {
                per_entity,
                total_records,
                cache,
            },
        }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}
