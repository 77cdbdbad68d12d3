//! HTTP host-based routing

use crate::{ClientRegistry, SubdomainResolver};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// HTTP routing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HttpRouterError {
    #[error("no token host")]
    NoRoutingHost,

    #[error("client not found for host")]
    ClientNotFound(String),
}

/// HTTP router: (override header | Host) -> subdomain -> session
pub struct HttpRouter<S> {
    registry: Arc<ClientRegistry<S>>,
    resolver: SubdomainResolver,
}

impl<S> HttpRouter<S> {
    pub fn new(registry: Arc<ClientRegistry<S>>, resolver: SubdomainResolver) -> Self {
        Self { registry, resolver }
    }

    pub fn resolver(&self) -> &SubdomainResolver {
        &self.resolver
    }

    /// Route a public request
    ///
    /// `override_host` (the `X-Hexrelay-Host` header) wins over `host` when present
    /// and non-empty. Returns the identifier together with its session.
    pub fn lookup(
        &self,
        host: Option<&str>,
        override_host: Option<&str>,
    ) -> Result<(String, Arc<S>), HttpRouterError> {
        let host = override_host
            .filter(|h| !h.is_empty())
            .or(host)
            .unwrap_or("");
        trace!("Looking up HTTP route for host: {}", host);

        let identifier = self
            .resolver
            .resolve(host)
            .ok_or(HttpRouterError::NoRoutingHost)?;

        let session = self
            .registry
            .get(identifier)
            .ok_or_else(|| HttpRouterError::ClientNotFound(identifier.to_string()))?;

        Ok((identifier.to_string(), session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> (HttpRouter<u32>, Arc<ClientRegistry<u32>>) {
        let registry = Arc::new(ClientRegistry::new());
        let router = HttpRouter::new(registry.clone(), SubdomainResolver::new("-hexrelay"));
        (router, registry)
    }

    #[test]
    fn test_lookup_by_host() {
        let (router, registry) = router();
        registry.set("foo", Arc::new(1));

        let (identifier, session) = router
            .lookup(Some("foo-hexrelay.example.com:8080"), None)
            .unwrap();
        assert_eq!(identifier, "foo");
        assert_eq!(*session, 1);
    }

    #[test]
    fn test_override_header_wins() {
        let (router, registry) = router();
        registry.set("foo", Arc::new(1));
        registry.set("bar", Arc::new(2));

        let (identifier, _) = router
            .lookup(
                Some("foo-hexrelay.example.com"),
                Some("bar-hexrelay.example.com"),
            )
            .unwrap();
        assert_eq!(identifier, "bar");

        // empty override falls back to Host
        let (identifier, _) = router
            .lookup(Some("foo-hexrelay.example.com"), Some(""))
            .unwrap();
        assert_eq!(identifier, "foo");
    }

    #[test]
    fn test_unresolvable_host() {
        let (router, _) = router();
        assert_eq!(
            router.lookup(Some("example.com"), None).unwrap_err(),
            HttpRouterError::NoRoutingHost
        );
        assert_eq!(
            router.lookup(None, None).unwrap_err(),
            HttpRouterError::NoRoutingHost
        );
    }

    #[test]
    fn test_unknown_client() {
        let (router, _) = router();
        let err = router
            .lookup(Some("nobody-hexrelay.example.com"), None)
            .unwrap_err();
        assert_eq!(err, HttpRouterError::ClientNotFound("nobody".to_string()));
        assert_eq!(err.to_string(), "client not found for host");
    }
}
