//! Message cache: the broker's only durable store.
//!
//! Undelivered messages are cached per `(service, username)` with a TTL and
//! retrieved by id or in bulk with an exclusion list. Production deployments
//! back [`MessageCache`] with an external KV store; that backend is a
//! collaborator outside this crate. [`MemoryCache`] is the in-process
//! implementation used by tests, simulations, and single-node setups.
//!
//! The service center never keeps message copies of its own beyond a single
//! request; everything durable goes through this interface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

use crate::rpc::MessageContainer;

/// Failure of the underlying store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// The backend rejected or failed the operation.
    #[error("cache backend error: {0}")]
    Backend(String),
}

/// At-least-once persistence of undelivered messages.
///
/// Implementations must be safe for concurrent use; the same instance is
/// shared by a service center and every connection it serves.
#[async_trait]
pub trait MessageCache: Send + Sync + 'static {
    /// Persist a message for `(service, username)` and return its freshly
    /// assigned id, unique within that namespace.
    ///
    /// A zero `ttl` means "do not persist": the call succeeds and returns an
    /// empty id. A positive `ttl` guarantees retrievability for at least
    /// `ttl`.
    async fn cache(
        &self,
        service: &str,
        username: &str,
        container: MessageContainer,
        ttl: Duration,
    ) -> Result<String, CacheError>;

    /// Fetch one cached message by id. `None` if unknown or expired; an
    /// expired record is never returned.
    async fn get(
        &self,
        service: &str,
        username: &str,
        id: &str,
    ) -> Result<Option<MessageContainer>, CacheError>;

    /// Fetch every non-expired cached message whose id is not in `exclude`.
    ///
    /// Ordering is unspecified but consistent within a single call; callers
    /// must not depend on it.
    async fn get_all(
        &self,
        service: &str,
        username: &str,
        exclude: &[String],
    ) -> Result<Vec<MessageContainer>, CacheError>;
}

struct CachedRecord {
    id: String,
    container: MessageContainer,
    enqueued_at: Instant,
    ttl: Duration,
}

impl CachedRecord {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.enqueued_at) > self.ttl
    }
}

#[derive(Default)]
struct UserEntry {
    next_id: u64,
    records: Vec<CachedRecord>,
}

impl UserEntry {
    fn prune(&mut self, now: Instant) {
        self.records.retain(|r| !r.expired(now));
    }
}

/// In-memory cache backend.
///
/// `HashMap` keyed by `(service, username)`, records kept in insertion
/// order, expiry enforced on every access plus opportunistic pruning on
/// insert. State is behind `Arc<Mutex<_>>` so clones share one store.
///
/// # Panics
///
/// Operations panic if the internal mutex is poisoned (a thread panicked
/// while holding the lock). Acceptable for the in-process backend;
/// externally backed implementations report `CacheError` instead.
#[derive(Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Mutex<HashMap<(String, String), UserEntry>>>,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) records for one user. Test hook.
    #[allow(clippy::expect_used)]
    pub fn live_records(&self, service: &str, username: &str) -> usize {
        let now = Instant::now();
        let inner = self.inner.lock().expect("mutex poisoned");
        inner
            .get(&(service.to_owned(), username.to_owned()))
            .map_or(0, |entry| entry.records.iter().filter(|r| !r.expired(now)).count())
    }
}

#[async_trait]
impl MessageCache for MemoryCache {
    #[allow(clippy::expect_used)]
    async fn cache(
        &self,
        service: &str,
        username: &str,
        mut container: MessageContainer,
        ttl: Duration,
    ) -> Result<String, CacheError> {
        if ttl.is_zero() {
            return Ok(String::new());
        }

        let now = Instant::now();
        let mut inner = self.inner.lock().expect("mutex poisoned");
        let entry = inner.entry((service.to_owned(), username.to_owned())).or_default();
        entry.prune(now);

        entry.next_id += 1;
        let id = entry.next_id.to_string();
        container.id.clone_from(&id);
        entry.records.push(CachedRecord { id: id.clone(), container, enqueued_at: now, ttl });
        Ok(id)
    }

    #[allow(clippy::expect_used)]
    async fn get(
        &self,
        service: &str,
        username: &str,
        id: &str,
    ) -> Result<Option<MessageContainer>, CacheError> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.get(&(service.to_owned(), username.to_owned())).and_then(|entry| {
            entry
                .records
                .iter()
                .find(|r| r.id == id && !r.expired(now))
                .map(|r| r.container.clone())
        }))
    }

    #[allow(clippy::expect_used)]
    async fn get_all(
        &self,
        service: &str,
        username: &str,
        exclude: &[String],
    ) -> Result<Vec<MessageContainer>, CacheError> {
        let now = Instant::now();
        let inner = self.inner.lock().expect("mutex poisoned");
        Ok(inner.get(&(service.to_owned(), username.to_owned())).map_or_else(Vec::new, |entry| {
            entry
                .records
                .iter()
                .filter(|r| !r.expired(now) && !exclude.contains(&r.id))
                .map(|r| r.container.clone())
                .collect()
        }))
    }
}
