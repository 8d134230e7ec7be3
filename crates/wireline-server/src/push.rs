//! Push notifier collaborator.
//!
//! When a send or forward lands on zero live connections, the service
//! center hands the delivery to an external best-effort push backend. The
//! backend itself (APNs, FCM, or a self-hosted gateway) is out of scope;
//! this trait is its seam. Subscription changes arriving on the wire are
//! relayed here as well, since they exist to maintain the push backend's
//! delivery bindings.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Push collaborator failure. Logged through `on_error`, never surfaced to
/// the dispatch caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushError {
    /// The backend reported a failure.
    #[error("push backend error: {0}")]
    Backend(String),
    /// The backend did not answer within the configured timeout.
    #[error("push timed out")]
    Timeout,
}

/// External out-of-band delivery used when no live connection exists.
#[async_trait]
pub trait PushNotifier: Send + Sync + 'static {
    /// Deliver a notification about a cached message.
    ///
    /// `sender_service`/`sender` are empty for server-originated messages;
    /// `info` carries the opaque per-request push parameters; `size` is the
    /// encoded body length of the cached message.
    async fn push(
        &self,
        receiver: &str,
        sender_service: &str,
        sender: &str,
        info: &HashMap<String, String>,
        message_id: &str,
        size: usize,
    ) -> Result<(), PushError>;

    /// Record a push subscription for `(service, username)`.
    async fn subscribe(
        &self,
        _service: &str,
        _username: &str,
        _params: &HashMap<String, String>,
    ) -> Result<(), PushError> {
        Ok(())
    }

    /// Drop a push subscription for `(service, username)`.
    async fn unsubscribe(
        &self,
        _service: &str,
        _username: &str,
        _params: &HashMap<String, String>,
    ) -> Result<(), PushError> {
        Ok(())
    }
}

/// A push notifier that drops everything. Useful for services that only
/// ever deliver to live connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPush;

#[async_trait]
impl PushNotifier for NoopPush {
    async fn push(
        &self,
        _receiver: &str,
        _sender_service: &str,
        _sender: &str,
        _info: &HashMap<String, String>,
        _message_id: &str,
        _size: usize,
    ) -> Result<(), PushError> {
        Ok(())
    }
}
