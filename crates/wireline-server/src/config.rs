//! Per-service configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::cache::{MemoryCache, MessageCache};
use crate::hooks::{EventHandler, NoopHandler};
use crate::push::{NoopPush, PushNotifier};

/// Immutable configuration of one service center.
///
/// Installed at construction and never mutated afterwards; all recognized
/// options are fields, so an unknown option cannot exist past the (out of
/// scope) bootstrap layer that builds this struct.
#[derive(Clone)]
pub struct ServiceConfig {
    /// Global connection cap for the service. 0 means unbounded.
    pub max_conns: usize,
    /// Distinct-user cap. 0 means unbounded.
    pub max_users: usize,
    /// Per-user connection cap. 0 means unbounded.
    pub max_conns_per_user: usize,
    /// Capacity of the forward channel; producers block when it is full.
    pub forward_queue: usize,
    /// Capacity of the subscribe channel; producers block when it is full.
    pub subscribe_queue: usize,
    /// Deadline for one push collaborator invocation.
    pub push_timeout: Duration,
    /// The durable message store.
    pub cache: Arc<dyn MessageCache>,
    /// The out-of-band delivery fallback.
    pub push: Arc<dyn PushNotifier>,
    /// Event callbacks and the forward-permission policy.
    pub hooks: Arc<dyn EventHandler>,
}

impl ServiceConfig {
    /// Unbounded caps, modest queue sizes, in-memory cache, no-op push and
    /// hooks. Fields are public; override what the service needs.
    pub fn new() -> Self {
        Self {
            max_conns: 0,
            max_users: 0,
            max_conns_per_user: 0,
            forward_queue: 64,
            subscribe_queue: 64,
            push_timeout: Duration::from_secs(5),
            cache: Arc::new(MemoryCache::new()),
            push: Arc::new(NoopPush),
            hooks: Arc::new(NoopHandler),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ServiceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConfig")
            .field("max_conns", &self.max_conns)
            .field("max_users", &self.max_users)
            .field("max_conns_per_user", &self.max_conns_per_user)
            .field("forward_queue", &self.forward_queue)
            .field("subscribe_queue", &self.subscribe_queue)
            .field("push_timeout", &self.push_timeout)
            .finish_non_exhaustive()
    }
}
