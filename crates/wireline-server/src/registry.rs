//! Connection registry: the bounded multi-index map behind fan-out.
//!
//! Two indices are kept consistent under one internal lock: the primary
//! `(service, username) → connections` map (insertion order preserved, which
//! is the fan-out order) and a secondary `uniq_id → key` index for cleanup.
//! Lookups hand out snapshots, so fan-out iterates without holding the lock
//! and stays stable under concurrent inserts and removals.
//!
//! Distinct connections may share `(service, username)`; they never share a
//! `uniq_id`.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::connection::Connection;
use crate::error::CapacityKind;

/// Cardinality limits enforced by [`ConnRegistry::add`]. A zero cap means
/// unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegistryLimits {
    /// Total connections across the registry.
    pub max_conns: usize,
    /// Distinct `(service, username)` keys.
    pub max_users: usize,
    /// Connections per `(service, username)` key.
    pub max_conns_per_user: usize,
}

struct Inner<S> {
    primary: HashMap<(String, String), Vec<Arc<Connection<S>>>>,
    secondary: HashMap<String, (String, String)>,
    total: usize,
}

/// Bounded multi-index map from user identity to live connections.
///
/// Internally synchronized; safe for many concurrent readers and mutators.
/// The lock is never held across an await point.
pub struct ConnRegistry<S> {
    limits: RegistryLimits,
    inner: RwLock<Inner<S>>,
}

impl<S> ConnRegistry<S> {
    /// An empty registry with the given limits.
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            limits,
            inner: RwLock::new(Inner {
                primary: HashMap::new(),
                secondary: HashMap::new(),
                total: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner<S>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner<S>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection, enforcing every cap in one critical section.
    ///
    /// # Errors
    ///
    /// The [`CapacityKind`] naming the first cap that was hit. Nothing is
    /// mutated on failure.
    pub fn add(&self, conn: Arc<Connection<S>>) -> Result<(), CapacityKind> {
        let key = (conn.service().to_owned(), conn.username().to_owned());
        let mut inner = self.write();

        if self.limits.max_conns > 0 && inner.total >= self.limits.max_conns {
            return Err(CapacityKind::TooManyConns);
        }
        let user_present = inner.primary.contains_key(&key);
        if !user_present && self.limits.max_users > 0 && inner.primary.len() >= self.limits.max_users
        {
            return Err(CapacityKind::TooManyUsers);
        }
        let per_user = inner.primary.get(&key).map_or(0, Vec::len);
        if self.limits.max_conns_per_user > 0 && per_user >= self.limits.max_conns_per_user {
            return Err(CapacityKind::TooManyConnsPerUser);
        }

        inner.secondary.insert(conn.uniq_id().to_owned(), key.clone());
        inner.primary.entry(key).or_default().push(conn);
        inner.total += 1;
        Ok(())
    }

    /// Snapshot of the live connections for one user, in insertion order.
    /// Callers iterate without holding any registry lock.
    pub fn get(&self, service: &str, username: &str) -> Vec<Arc<Connection<S>>> {
        self.read()
            .primary
            .get(&(service.to_owned(), username.to_owned()))
            .cloned()
            .unwrap_or_default()
    }

    /// Remove a connection from both indices. Idempotent; returns whether
    /// anything was removed.
    pub fn remove(&self, conn: &Connection<S>) -> bool {
        let mut inner = self.write();
        let Some(key) = inner.secondary.remove(conn.uniq_id()) else {
            return false;
        };
        let Some(bucket) = inner.primary.get_mut(&key) else {
            return false;
        };

        let before = bucket.len();
        bucket.retain(|c| c.uniq_id() != conn.uniq_id());
        let removed = before - bucket.len();
        if bucket.is_empty() {
            inner.primary.remove(&key);
        }
        inner.total -= removed;
        removed > 0
    }

    /// Total registered connections.
    pub fn conn_count(&self) -> usize {
        self.read().total
    }

    /// Distinct `(service, username)` keys currently present.
    pub fn user_count(&self) -> usize {
        self.read().primary.len()
    }

    /// Live connections for one user.
    pub fn conns_for_user(&self, service: &str, username: &str) -> usize {
        self.read().primary.get(&(service.to_owned(), username.to_owned())).map_or(0, Vec::len)
    }
}

impl<S> std::fmt::Debug for ConnRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        f.debug_struct("ConnRegistry")
            .field("limits", &self.limits)
            .field("conns", &inner.total)
            .field("users", &inner.primary.len())
            .finish()
    }
}
