//! Multi-service router.
//!
//! Maps a service name to its [`ServiceCenter`], creating centers lazily
//! through a configured factory. A newly accepted connection is routed here
//! once the external handshake has yielded its `(service, username)`
//! identity.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::center::ServiceCenter;
use crate::config::ServiceConfig;
use crate::connection::Connection;
use crate::error::ServerError;
use crate::rpc::{DispatchResult, ForwardRequest, SendRequest};

/// Produces the configuration for a service the router has not seen yet.
/// Returning `None` rejects the service.
pub type CenterFactory = dyn Fn(&str) -> Option<ServiceConfig> + Send + Sync;

/// Routes connections and dispatch requests to per-service centers.
pub struct ServiceRouter<S> {
    centers: RwLock<HashMap<String, Arc<ServiceCenter<S>>>>,
    factory: Box<CenterFactory>,
}

impl<S> ServiceRouter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// A router that lazily builds centers through `factory`.
    pub fn new(factory: impl Fn(&str) -> Option<ServiceConfig> + Send + Sync + 'static) -> Self {
        Self { centers: RwLock::new(HashMap::new()), factory: Box::new(factory) }
    }

    /// The center for `service`, creating it on first use. `None` when the
    /// factory declines the service.
    pub fn center(&self, service: &str) -> Option<Arc<ServiceCenter<S>>> {
        {
            let centers = self.centers.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(center) = centers.get(service) {
                return Some(Arc::clone(center));
            }
        }

        let config = (self.factory)(service)?;
        let mut centers = self.centers.write().unwrap_or_else(PoisonError::into_inner);
        let center = centers
            .entry(service.to_owned())
            .or_insert_with(|| {
                tracing::info!(service, "service center created");
                ServiceCenter::new(service, config)
            });
        Some(Arc::clone(center))
    }

    /// Route a handshake-completed connection to its service center and
    /// start serving it.
    pub async fn new_conn(&self, conn: Connection<S>) -> Result<Arc<Connection<S>>, ServerError> {
        let service = conn.service().to_owned();
        let Some(center) = self.center(&service) else {
            tracing::warn!(service, "rejecting connection for unknown service");
            conn.close().await;
            return Err(ServerError::InvalidRequest(format!("unknown service {service:?}")));
        };
        center.new_conn(conn).await
    }

    /// Dispatch a server-originated send within `service`.
    pub async fn send(&self, service: &str, req: &SendRequest) -> DispatchResult {
        match self.center(service) {
            Some(center) => center.send(req).await,
            None => DispatchResult::from_error(ServerError::InvalidRequest(format!(
                "unknown service {service:?}"
            ))),
        }
    }

    /// Dispatch a forward to the receiver's service.
    pub async fn forward(&self, req: ForwardRequest, dont_ask: bool) -> Option<DispatchResult> {
        match self.center(&req.receiver_service) {
            Some(center) => center.forward(req, dont_ask).await,
            None => Some(DispatchResult::from_error(ServerError::InvalidRequest(format!(
                "unknown service {:?}",
                req.receiver_service
            )))),
        }
    }
}

impl<S> std::fmt::Debug for ServiceRouter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let centers = self.centers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("ServiceRouter").field("services", &centers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wireline_proto::{Message, SessionKeys};

    type TestRouter = ServiceRouter<tokio::io::DuplexStream>;

    fn router() -> TestRouter {
        ServiceRouter::new(|service| {
            if service == "banned" { None } else { Some(ServiceConfig::new()) }
        })
    }

    #[tokio::test]
    async fn centers_are_created_lazily_and_reused() {
        let router = router();
        let first = router.center("chat").unwrap();
        let again = router.center("chat").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(first.service(), "chat");
    }

    #[tokio::test]
    async fn declined_services_have_no_center() {
        let router = router();
        assert!(router.center("banned").is_none());

        let keys = SessionKeys::derive(b"router tests", None);
        let (a, _b) = tokio::io::duplex(1024);
        let conn = Connection::new(a, &keys, "banned", "alice", None);
        let err = router.new_conn(conn).await.unwrap_err();
        assert!(matches!(err, ServerError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn send_routes_to_the_named_service() {
        let router = router();
        let req = crate::rpc::SendRequest::new(
            "alice",
            Message::with_body(b"x".to_vec()),
            std::time::Duration::ZERO,
        );

        let ok = router.send("chat", &req).await;
        assert!(ok.error.is_none());

        let unknown = router.send("banned", &req).await;
        assert!(matches!(unknown.error, Some(ServerError::InvalidRequest(_))));
    }
}
