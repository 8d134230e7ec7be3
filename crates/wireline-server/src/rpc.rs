//! Dispatch request and result records.
//!
//! These are the records exchanged between the brokering core and its
//! callers: local API users, the per-connection forward pipeline, and the
//! (out-of-scope) cluster peer RPC, which is why they carry serde attributes
//! with the wire-stable JSON field names.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use wireline_proto::Message;

use crate::error::ServerError;

/// A message together with its cache id and sender identity.
///
/// Server-originated messages carry empty sender fields; the cache assigns
/// `id` on insert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContainer {
    /// Cache-assigned id; empty until cached (or when caching was skipped).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Sending username; empty for server-originated messages.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sender: String,
    /// Sending user's service; empty for server-originated messages.
    #[serde(default, rename = "sender-service", skip_serializing_if = "String::is_empty")]
    pub sender_service: String,
    /// The message itself.
    #[serde(rename = "msg")]
    pub message: Message,
}

impl MessageContainer {
    /// A container for a message the server originates itself.
    pub fn server_originated(message: Message) -> Self {
        Self { message, ..Self::default() }
    }

    /// Whether this message was originated by the server rather than a user.
    pub fn from_server(&self) -> bool {
        self.sender.is_empty()
    }
}

/// A server-originated delivery request for one receiver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    /// Receiving username within the target service.
    pub receiver: String,
    /// Message to deliver.
    #[serde(rename = "msg")]
    pub message: Message,
    /// Cache TTL; zero skips caching.
    pub ttl: Duration,
    /// Opaque parameters handed to the push collaborator on fallback.
    #[serde(default, rename = "push-info", skip_serializing_if = "HashMap::is_empty")]
    pub push_info: HashMap<String, String>,
    /// Suppress the push fallback even when no connection is live.
    #[serde(default, rename = "dont-push")]
    pub dont_push: bool,
}

impl SendRequest {
    /// A request with no push info and push fallback enabled.
    pub fn new(receiver: impl Into<String>, message: Message, ttl: Duration) -> Self {
        Self {
            receiver: receiver.into(),
            message,
            ttl,
            push_info: HashMap::new(),
            dont_push: false,
        }
    }
}

/// A user-to-user delivery request, possibly gated by the forward policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    /// Receiving username.
    pub receiver: String,
    /// Receiving user's service; defaults to the sender's service when the
    /// wire request omits it.
    #[serde(rename = "receiver-service")]
    pub receiver_service: String,
    /// Cache TTL; zero skips caching.
    pub ttl: Duration,
    /// Suppress the push fallback.
    #[serde(default, rename = "dont-push")]
    pub dont_push: bool,
    /// Skip the forward-permission policy. Set for requests arriving from
    /// cluster peers, which were already authorized at their origin node.
    #[serde(default, rename = "dont-ask-permission")]
    pub dont_ask: bool,
    /// The message plus sender identity.
    #[serde(flatten)]
    pub container: MessageContainer,
}

/// Outcome of one dispatch for one fan-out target.
#[derive(Debug)]
pub struct ConnResult {
    /// The target connection's unique id.
    pub conn_id: String,
    /// Write failure, if any. `None` means the target received the message.
    pub error: Option<ServerError>,
    /// Whether the target elects to appear in presence queries.
    pub visible: bool,
}

/// Aggregate outcome of one send or forward dispatch.
///
/// A top-level `error` means the dispatch failed before fan-out; per-target
/// errors are independent of each other.
#[derive(Debug, Default)]
pub struct DispatchResult {
    /// Correlation id assigned by the cluster RPC layer; empty locally.
    pub call_id: String,
    /// Dispatch-level failure, set before any fan-out happened.
    pub error: Option<ServerError>,
    /// One entry per fan-out target in snapshot order.
    pub results: Vec<ConnResult>,
}

impl DispatchResult {
    /// A result that failed before fan-out.
    pub fn from_error(error: ServerError) -> Self {
        Self { error: Some(error), ..Self::default() }
    }

    /// Record the outcome for one fan-out target.
    pub fn append(&mut self, conn_id: &str, visible: bool, error: Option<ServerError>) {
        self.results.push(ConnResult { conn_id: conn_id.to_owned(), error, visible });
    }

    /// Number of targets that received the message.
    pub fn delivered(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_none()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_accumulates_in_order() {
        let mut result = DispatchResult::default();
        result.append("c1", true, None);
        result.append("c2", false, Some(ServerError::PeerWrite("broken pipe".to_string())));
        result.append("c3", true, None);

        assert_eq!(result.results.len(), 3);
        assert_eq!(result.delivered(), 2);
        assert_eq!(result.results[0].conn_id, "c1");
        assert!(result.results[1].error.is_some());
        assert!(!result.results[1].visible);
    }

    #[test]
    fn server_originated_containers_have_no_sender() {
        let container = MessageContainer::server_originated(Message::with_body(b"x".to_vec()));
        assert!(container.from_server());
        assert!(container.id.is_empty());
    }

    #[test]
    fn forward_request_json_round_trips() {
        let req = ForwardRequest {
            receiver: "bob".to_string(),
            receiver_service: "chat".to_string(),
            ttl: Duration::from_secs(60),
            dont_push: true,
            dont_ask: false,
            container: MessageContainer {
                id: String::new(),
                sender: "alice".to_string(),
                sender_service: "chat".to_string(),
                message: Message::with_body(b"hi".to_vec()),
            },
        };

        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"receiver-service\""));
        assert!(json.contains("\"dont-push\""));

        let back: ForwardRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.receiver, req.receiver);
        assert_eq!(back.container.sender, "alice");
        assert_eq!(back.container.message.body, b"hi");
    }
}
