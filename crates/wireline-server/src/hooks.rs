//! Event hooks and the forward-permission policy.
//!
//! A service center is configured with one immutable collaborator record
//! implementing [`EventHandler`]. Every method has a no-op default so
//! embedders implement only what they observe; [`NoopHandler`] is the
//! explicit all-defaults instance.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::connection::ConnInfo;
use crate::error::ServerError;
use crate::rpc::ForwardRequest;
use wireline_proto::Message;

/// Verdict of the forward-permission policy.
#[derive(Debug, Clone, Default)]
pub struct ForwardDecision {
    /// Deliver the forward at all. `false` silently drops the request.
    pub accept: bool,
    /// Invoke the push fallback if fan-out reaches no live connection.
    /// Replaces the request's own push preference.
    pub push: bool,
    /// Push parameters to use on fallback.
    pub push_info: HashMap<String, String>,
}

impl ForwardDecision {
    /// Accept the forward, keeping the request's push preference.
    pub fn accept(req: &ForwardRequest) -> Self {
        Self { accept: true, push: !req.dont_push, push_info: HashMap::new() }
    }

    /// Silently drop the forward.
    pub fn deny() -> Self {
        Self::default()
    }
}

/// Callbacks a service center invokes on connection and dispatch events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// A connection surfaced an inbound `Data` message.
    async fn on_message(&self, _conn: &ConnInfo, _message: &Message) {}

    /// An error occurred; `conn` is absent for errors without a connection
    /// context (push fallback failures).
    async fn on_error(&self, _conn: Option<&ConnInfo>, _error: &ServerError) {}

    /// A connection left the registry. `reason` is `None` for an orderly
    /// close.
    async fn on_logout(&self, _conn: &ConnInfo, _reason: Option<&ServerError>) {}

    /// Decide whether a user-originated forward may be delivered.
    ///
    /// Only consulted when the request does not carry cluster-level
    /// authorization (`dont_ask == false` at the dispatch site).
    async fn should_forward(&self, req: &ForwardRequest) -> ForwardDecision {
        ForwardDecision::accept(req)
    }
}

/// The all-defaults event handler.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHandler;

#[async_trait]
impl EventHandler for NoopHandler {}
