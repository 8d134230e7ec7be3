//! Wireline brokering core.
//!
//! The server side of a connection-oriented messaging service: clients hold
//! persistent encrypted streams, the broker caches undelivered messages,
//! fans each delivery out to every live connection of the receiver, gates
//! user-to-user forwards behind a permission policy, and falls back to an
//! external push notifier when nobody is connected.
//!
//! # Architecture
//!
//! - [`Connection`]: one keyed stream; a read-loop task plus a serialized
//!   write path ([`connection`]).
//! - [`ConnRegistry`]: bounded `(service, username) → connections` map with
//!   snapshot iteration ([`registry`]).
//! - [`MessageCache`]: the only durable store; trait plus in-memory backend
//!   ([`cache`]).
//! - [`ServiceCenter`]: per-service send/forward dispatch with per-target
//!   error accounting and push fallback ([`center`]).
//! - [`ServiceRouter`]: service name → center, lazily created ([`router`]).
//! - [`Server`]: the TCP accept loop gluing it all to real sockets; the
//!   credential handshake itself is an external [`Handshake`] collaborator.
//!
//! Framing and command encoding live in [`wireline_proto`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod center;
pub mod config;
pub mod connection;
mod error;
pub mod hooks;
pub mod push;
pub mod registry;
pub mod router;
pub mod rpc;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

pub use cache::{CacheError, MemoryCache, MessageCache};
pub use center::ServiceCenter;
pub use config::ServiceConfig;
pub use connection::{ConnInfo, ConnState, Connection, SubscribeRequest};
pub use error::{CapacityKind, ServerError};
pub use hooks::{EventHandler, ForwardDecision, NoopHandler};
pub use push::{NoopPush, PushError, PushNotifier};
pub use registry::{ConnRegistry, RegistryLimits};
pub use router::ServiceRouter;
pub use rpc::{ConnResult, DispatchResult, ForwardRequest, MessageContainer, SendRequest};
use wireline_proto::SessionKeys;

/// What a completed handshake hands back: the stream (possibly wrapped),
/// the authenticated identity, and the negotiated session keys.
pub struct HandshakeOutcome {
    /// The byte stream to serve. Handshakes may consume leading bytes but
    /// must leave the stream positioned at the first command frame.
    pub stream: TcpStream,
    /// Service the client authenticated into.
    pub service: String,
    /// Authenticated username.
    pub username: String,
    /// Freshly negotiated per-connection keys.
    pub keys: SessionKeys,
}

/// The external credential/key negotiation collaborator.
///
/// Runs once per accepted socket, before the connection exists. How
/// credentials are verified and keys agreed is outside this crate; the
/// contract is only that the outcome carries a valid identity and fresh
/// keys.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Perform the handshake on a freshly accepted socket.
    async fn establish(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<HandshakeOutcome, ServerError>;
}

/// Production accept loop: TCP listener, external handshake, router.
pub struct Server {
    listener: TcpListener,
    router: Arc<ServiceRouter<TcpStream>>,
    handshake: Arc<dyn Handshake>,
}

impl Server {
    /// Bind the listener.
    pub async fn bind(
        addr: &str,
        router: Arc<ServiceRouter<TcpStream>>,
        handshake: Arc<dyn Handshake>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        Ok(Self { listener, router, handshake })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until the listener fails fatally. Each accepted
    /// socket gets its own task for handshake and serving.
    pub async fn run(self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let router = Arc::clone(&self.router);
                    let handshake = Arc::clone(&self.handshake);
                    tokio::spawn(async move {
                        handle_accepted(router, handshake, stream, peer).await;
                    });
                },
                Err(err) => {
                    tracing::error!(%err, "accept failed");
                },
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server").field("router", &self.router).finish_non_exhaustive()
    }
}

/// Handshake one accepted socket and hand it to the router.
async fn handle_accepted(
    router: Arc<ServiceRouter<TcpStream>>,
    handshake: Arc<dyn Handshake>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    match handshake.establish(stream, peer).await {
        Ok(outcome) => {
            let conn = Connection::new(
                outcome.stream,
                &outcome.keys,
                outcome.service,
                outcome.username,
                Some(peer),
            );
            if let Err(err) = router.new_conn(conn).await {
                tracing::warn!(%peer, %err, "connection rejected");
            }
        },
        Err(err) => {
            tracing::warn!(%peer, %err, "handshake failed");
        },
    }
}
