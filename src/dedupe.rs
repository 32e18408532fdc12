//! In-Flight De-duplicator
//!
//! At most one outstanding request per canonical key. Concurrent callers for
//! the same key share the first caller's future; the association is dropped
//! as soon as that future settles, whatever the outcome, so the next call
//! starts fresh and nothing negative is remembered. Each request runs on its
//! own task, so a caller that stops waiting never strands the slot.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::canonical::RequestKey;

type SharedResult<R> = Shared<BoxFuture<'static, R>>;

struct Slot<R: Clone, A> {
    id: u64,
    future: SharedResult<R>,
    attachment: A,
}

// == In-Flight Table ==
/// Outstanding requests by key. Each slot can carry an attachment `A` that
/// joiners receive alongside the shared future.
pub struct InFlight<R: Clone, A = ()> {
    slots: Arc<Mutex<HashMap<RequestKey, Slot<R, A>>>>,
    next_id: AtomicU64,
}

impl<R, A> InFlight<R, A>
where
    R: Clone + Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    // == Begin ==
    /// Starts `factory` unless a request for `key` is already outstanding.
    ///
    /// Returns the shared future, the slot's attachment (`attachment` when
    /// this call started the request, the existing one when it joined) and
    /// whether it joined.
    pub fn begin<F, Fut>(&self, key: &RequestKey, attachment: A, factory: F) -> (SharedResult<R>, A, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(key) {
            debug!(key = %key, "Joined in-flight request");
            return (slot.future.clone(), slot.attachment.clone(), true);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let future = self.settling(key.clone(), id, factory());
        // Driven to completion even if every caller walks away.
        tokio::spawn(future.clone());
        slots.insert(
            key.clone(),
            Slot {
                id,
                future: future.clone(),
                attachment: attachment.clone(),
            },
        );
        (future, attachment, false)
    }

    /// Wraps `inner` so the slot is released the moment it settles. The id
    /// check keeps a settled request from removing a newer one for the same key.
    fn settling<Fut>(&self, key: RequestKey, id: u64, inner: Fut) -> SharedResult<R>
    where
        Fut: Future<Output = R> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        async move {
            let result = inner.await;
            let mut slots = slots.lock();
            if slots.get(&key).is_some_and(|slot| slot.id == id) {
                slots.remove(&key);
            }
            result
        }
        .boxed()
        .shared()
    }

    pub fn contains(&self, key: &RequestKey) -> bool {
        self.slots.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}

impl<R, A> InFlight<R, A>
where
    R: Clone + Send + Sync + 'static,
    A: Clone + Default + Send + 'static,
{
    // == Dedupe ==
    /// Runs `factory` unless a request for `key` is already outstanding, in
    /// which case the caller joins it. Returns the result and whether this
    /// caller joined an existing request.
    pub async fn dedupe<F, Fut>(&self, key: &RequestKey, factory: F) -> (R, bool)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        let (future, _, joined) = self.begin(key, A::default(), factory);
        (future.await, joined)
    }
}

impl<R, A> Default for InFlight<R, A>
where
    R: Clone + Send + Sync + 'static,
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
