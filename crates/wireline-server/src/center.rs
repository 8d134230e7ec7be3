//! Per-service dispatch: the send and forward pipelines.
//!
//! A `ServiceCenter` owns one service's registry, its immutable
//! configuration, and the consumer ends of the forward and subscribe
//! channels its connections produce into. Dispatch follows one shape for
//! both pipelines: validate, snapshot the fan-out targets, cache, deliver
//! to every live connection with per-target error accounting, and fall
//! through to the push collaborator when nothing was delivered.

use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::config::ServiceConfig;
use crate::connection::{Connection, ServiceLinks, SubscribeRequest, validate_username};
use crate::error::ServerError;
use crate::registry::{ConnRegistry, RegistryLimits};
use crate::rpc::{DispatchResult, ForwardRequest, MessageContainer, SendRequest};

/// Dispatch hub for one service.
pub struct ServiceCenter<S> {
    service: String,
    config: ServiceConfig,
    registry: ConnRegistry<S>,
    forward_tx: mpsc::Sender<ForwardRequest>,
    subscribe_tx: mpsc::Sender<SubscribeRequest>,
}

impl<S> ServiceCenter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Create the center and spawn its channel consumers.
    ///
    /// Both channels are bounded by the configured queue sizes; connection
    /// tasks block on a full queue, which is the back-pressure contract.
    pub fn new(service: impl Into<String>, config: ServiceConfig) -> Arc<Self> {
        let (forward_tx, forward_rx) = mpsc::channel(config.forward_queue.max(1));
        let (subscribe_tx, subscribe_rx) = mpsc::channel(config.subscribe_queue.max(1));
        let registry = ConnRegistry::new(RegistryLimits {
            max_conns: config.max_conns,
            max_users: config.max_users,
            max_conns_per_user: config.max_conns_per_user,
        });

        let center = Arc::new(Self {
            service: service.into(),
            config,
            registry,
            forward_tx,
            subscribe_tx,
        });

        // The pumps hold weak references: dropping the last strong handle
        // (and with it the center's senders) lets them drain and exit.
        tokio::spawn(pump_forwards(Arc::downgrade(&center), forward_rx));
        tokio::spawn(pump_subscriptions(Arc::downgrade(&center), subscribe_rx));
        center
    }

    /// Service name this center dispatches for.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Live connections registered with this center.
    pub fn conn_count(&self) -> usize {
        self.registry.conn_count()
    }

    /// Live connections for one user of this service.
    pub fn conns_for_user(&self, username: &str) -> usize {
        self.registry.conns_for_user(&self.service, username)
    }

    /// Admit a handshake-completed connection and start serving it.
    ///
    /// Validates the username, installs the cache and channel references,
    /// registers the connection, and spawns its serving task. On any
    /// rejection the connection is closed and `on_error` is invoked.
    pub async fn new_conn(
        self: &Arc<Self>,
        conn: Connection<S>,
    ) -> Result<Arc<Connection<S>>, ServerError> {
        if conn.service() != self.service {
            let err = ServerError::InvalidRequest(format!(
                "connection for service {:?} routed to center {:?}",
                conn.service(),
                self.service
            ));
            self.config.hooks.on_error(Some(&conn.info()), &err).await;
            conn.close().await;
            return Err(err);
        }
        if let Err(err) = validate_username(conn.username()) {
            self.config.hooks.on_error(Some(&conn.info()), &err).await;
            conn.close().await;
            return Err(err);
        }

        conn.install(ServiceLinks {
            cache: Arc::clone(&self.config.cache),
            forward_tx: self.forward_tx.clone(),
            subscribe_tx: self.subscribe_tx.clone(),
        });

        let conn = Arc::new(conn);
        if let Err(kind) = self.registry.add(Arc::clone(&conn)) {
            let err = ServerError::Capacity(kind);
            self.config.hooks.on_error(Some(&conn.info()), &err).await;
            conn.close().await;
            return Err(err);
        }

        tracing::debug!(
            service = %self.service,
            username = %conn.username(),
            conn = %conn.uniq_id(),
            "connection admitted"
        );

        let center = Arc::clone(self);
        let serving = Arc::clone(&conn);
        tokio::spawn(async move {
            center.serve_conn(serving).await;
        });
        Ok(conn)
    }

    /// Drive one connection until it ends, then unregister and log out.
    async fn serve_conn(&self, conn: Arc<Connection<S>>) {
        let reason = conn.run_read_loop(&self.config.hooks).await;

        self.registry.remove(&conn);
        self.config.hooks.on_logout(&conn.info(), reason.as_ref()).await;
        conn.close().await;

        match reason {
            None => tracing::debug!(conn = %conn.uniq_id(), "connection closed"),
            Some(err) => {
                tracing::info!(conn = %conn.uniq_id(), %err, "connection terminated");
            },
        }
    }

    /// Deliver a server-originated message to every live connection of
    /// `req.receiver`, caching it first and falling back to push when no
    /// connection received it.
    pub async fn send(&self, req: &SendRequest) -> DispatchResult {
        if req.message.is_empty() {
            return DispatchResult::from_error(ServerError::InvalidRequest(
                "empty message".to_owned(),
            ));
        }
        if req.receiver.is_empty() {
            return DispatchResult::from_error(ServerError::InvalidRequest(
                "no receiver".to_owned(),
            ));
        }

        let conns = self.registry.get(&self.service, &req.receiver);
        let container = MessageContainer::server_originated(req.message.clone());
        let id = match self
            .config
            .cache
            .cache(&self.service, &req.receiver, container, req.ttl)
            .await
        {
            Ok(id) => id,
            Err(err) => return DispatchResult::from_error(err.into()),
        };

        let mut ret = DispatchResult::default();
        let delivered = self.fan_out(&conns, &req.message, &id, &mut ret).await;

        if delivered == 0 && !req.dont_push {
            self.push_fallback(&req.receiver, "", "", &req.push_info, &id, req.message.size())
                .await;
        }
        ret
    }

    /// Deliver a user-to-user message, consulting the forward-permission
    /// policy unless the request carries cluster-level authorization.
    ///
    /// Returns `None` when the policy denies the forward: the request is
    /// silently dropped, the cache untouched, and the originator told
    /// nothing.
    pub async fn forward(
        &self,
        mut req: ForwardRequest,
        dont_ask: bool,
    ) -> Option<DispatchResult> {
        if req.container.message.is_empty() {
            return Some(DispatchResult::from_error(ServerError::InvalidRequest(
                "empty message".to_owned(),
            )));
        }
        if req.receiver.is_empty() {
            return Some(DispatchResult::from_error(ServerError::InvalidRequest(
                "no receiver".to_owned(),
            )));
        }
        if req.receiver_service != self.service {
            // Cross-service routing happens a tier above (router / cluster
            // peers); a center only ever dispatches within its own service.
            tracing::warn!(
                service = %self.service,
                requested = %req.receiver_service,
                "dropping forward for a different service"
            );
            return None;
        }

        let mut should_push = !req.dont_push;
        let mut push_info = std::collections::HashMap::new();

        if !dont_ask {
            // A user-originated forward: the id must not be attacker chosen,
            // and the policy decides acceptance and push behavior.
            req.container.id.clear();
            let decision = self.config.hooks.should_forward(&req).await;
            if !decision.accept {
                return None;
            }
            should_push = decision.push;
            push_info = decision.push_info;
        }

        let conns = self.registry.get(&self.service, &req.receiver);
        let sender = req.container.sender.clone();
        let sender_service = req.container.sender_service.clone();
        let message = req.container.message.clone();

        let id = match self
            .config
            .cache
            .cache(&self.service, &req.receiver, req.container, req.ttl)
            .await
        {
            Ok(id) => id,
            Err(err) => return Some(DispatchResult::from_error(err.into())),
        };

        let mut ret = DispatchResult::default();
        let delivered = self.fan_out(&conns, &message, &id, &mut ret).await;

        if delivered == 0 && should_push {
            self.push_fallback(&req.receiver, &sender_service, &sender, &push_info, &id, message.size())
                .await;
        }
        Some(ret)
    }

    /// Write one message to every snapshot target, recording per-target
    /// outcomes. A failed target is closed; the registry reaps it through
    /// its serving task. Returns the number of successful writes.
    async fn fan_out(
        &self,
        conns: &[Arc<Connection<S>>],
        message: &wireline_proto::Message,
        id: &str,
        ret: &mut DispatchResult,
    ) -> usize {
        let mut delivered = 0;
        for conn in conns {
            match conn.send_message(message, id, None).await {
                Ok(()) => {
                    delivered += 1;
                    ret.append(conn.uniq_id(), conn.visible(), None);
                },
                Err(err) => {
                    tracing::warn!(conn = %conn.uniq_id(), %err, "fan-out write failed");
                    ret.append(conn.uniq_id(), conn.visible(), Some(err));
                    conn.close().await;
                },
            }
        }
        delivered
    }

    /// Invoke the push collaborator under the configured timeout. Failures
    /// are reported through `on_error` and never surfaced to the caller.
    async fn push_fallback(
        &self,
        receiver: &str,
        sender_service: &str,
        sender: &str,
        info: &std::collections::HashMap<String, String>,
        id: &str,
        size: usize,
    ) {
        let attempt = tokio::time::timeout(
            self.config.push_timeout,
            self.config.push.push(receiver, sender_service, sender, info, id, size),
        )
        .await;

        let err = match attempt {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(_) => crate::push::PushError::Timeout,
        };
        let err = ServerError::Push(err);
        tracing::warn!(receiver, %err, "push fallback failed");
        self.config.hooks.on_error(None, &err).await;
    }
}

impl<S> std::fmt::Debug for ServiceCenter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceCenter")
            .field("service", &self.service)
            .field("conns", &self.registry.conn_count())
            .finish_non_exhaustive()
    }
}

/// Single consumer of the forward channel: user-originated requests go
/// through the full permission-checked pipeline.
async fn pump_forwards<S>(center: Weak<ServiceCenter<S>>, mut rx: mpsc::Receiver<ForwardRequest>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(req) = rx.recv().await {
        let Some(center) = center.upgrade() else {
            break;
        };
        let receiver = req.receiver.clone();
        match center.forward(req, false).await {
            None => tracing::debug!(%receiver, "forward dropped by policy"),
            Some(result) => {
                if let Some(err) = &result.error {
                    tracing::warn!(%receiver, %err, "forward dispatch failed");
                }
            },
        }
    }
}

/// Single consumer of the subscribe channel: subscription changes maintain
/// the push backend's delivery bindings.
async fn pump_subscriptions<S>(
    center: Weak<ServiceCenter<S>>,
    mut rx: mpsc::Receiver<SubscribeRequest>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    while let Some(req) = rx.recv().await {
        let Some(center) = center.upgrade() else {
            break;
        };
        let result = if req.subscribe {
            center.config.push.subscribe(&req.service, &req.username, &req.params).await
        } else {
            center.config.push.unsubscribe(&req.service, &req.username, &req.params).await
        };
        if let Err(err) = result {
            let err = ServerError::Push(err);
            tracing::warn!(username = %req.username, %err, "subscription update failed");
            center.config.hooks.on_error(None, &err).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cache::{MemoryCache, MessageCache};
    use wireline_proto::{Message, SessionKeys};

    type TestCenter = Arc<ServiceCenter<tokio::io::DuplexStream>>;

    fn center_with(config: ServiceConfig) -> TestCenter {
        ServiceCenter::new("svc", config)
    }

    #[tokio::test]
    async fn send_rejects_empty_message_without_touching_the_cache() {
        let cache = MemoryCache::new();
        let mut config = ServiceConfig::new();
        config.cache = Arc::new(cache.clone());
        let center = center_with(config);

        let req = SendRequest::new("alice", Message::default(), Duration::from_secs(60));
        let result = center.send(&req).await;

        assert!(matches!(result.error, Some(ServerError::InvalidRequest(_))));
        assert!(result.results.is_empty());
        assert_eq!(cache.live_records("svc", "alice"), 0);
    }

    #[tokio::test]
    async fn send_rejects_empty_receiver() {
        let center = center_with(ServiceConfig::new());
        let req =
            SendRequest::new("", Message::with_body(b"x".to_vec()), Duration::from_secs(60));
        let result = center.send(&req).await;
        assert!(matches!(result.error, Some(ServerError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn offline_send_still_caches() {
        let cache = MemoryCache::new();
        let mut config = ServiceConfig::new();
        config.cache = Arc::new(cache.clone());
        let center = center_with(config);

        let req = SendRequest::new(
            "alice",
            Message::with_body(b"kept for later".to_vec()),
            Duration::from_secs(60),
        );
        let result = center.send(&req).await;

        assert!(result.error.is_none());
        assert!(result.results.is_empty());
        assert_eq!(cache.live_records("svc", "alice"), 1);

        let all = cache.get_all("svc", "alice", &[]).await.unwrap();
        assert_eq!(all[0].message.body, b"kept for later");
        assert!(all[0].from_server());
    }

    #[tokio::test]
    async fn connections_with_invalid_usernames_are_rejected() {
        let center = center_with(ServiceConfig::new());
        let keys = SessionKeys::derive(b"center tests", None);
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Connection::new(a, &keys, "svc", "bad:name", None);

        let err = center.new_conn(conn).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidUsername(_)));
        assert_eq!(center.conn_count(), 0);
    }

    #[tokio::test]
    async fn connections_for_another_service_are_rejected() {
        let center = center_with(ServiceConfig::new());
        let keys = SessionKeys::derive(b"center tests", None);
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Connection::new(a, &keys, "other", "alice", None);

        let err = center.new_conn(conn).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn capacity_rejection_closes_the_new_connection() {
        let mut config = ServiceConfig::new();
        config.max_conns_per_user = 1;
        let center = center_with(config);
        let keys = SessionKeys::derive(b"center tests", None);

        let (a, _keep_a) = tokio::io::duplex(1024);
        center.new_conn(Connection::new(a, &keys, "svc", "alice", None)).await.unwrap();

        let (b, _keep_b) = tokio::io::duplex(1024);
        let err =
            center.new_conn(Connection::new(b, &keys, "svc", "alice", None)).await.unwrap_err();

        assert!(matches!(
            err,
            ServerError::Capacity(crate::error::CapacityKind::TooManyConnsPerUser)
        ));
        assert_eq!(center.conn_count(), 1);
    }

    #[tokio::test]
    async fn forward_for_a_foreign_service_is_dropped() {
        let center = center_with(ServiceConfig::new());
        let req = ForwardRequest {
            receiver: "bob".to_owned(),
            receiver_service: "elsewhere".to_owned(),
            ttl: Duration::from_secs(60),
            dont_push: true,
            dont_ask: false,
            container: crate::rpc::MessageContainer {
                id: String::new(),
                sender: "alice".to_owned(),
                sender_service: "svc".to_owned(),
                message: Message::with_body(b"hi".to_vec()),
            },
        };
        assert!(center.forward(req, false).await.is_none());
    }
}
