//! TCP port-based routing
//!
//! Raw TCP carries no host name, so each public port is bound to one fixed
//! routing identifier up front.

use crate::ClientRegistry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

/// TCP routing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TcpRouterError {
    #[error("No route for port {0}")]
    NoRoute(u16),

    #[error("Client {identifier} not connected (port {port})")]
    ClientNotFound { port: u16, identifier: String },

    #[error("Invalid TCP route {0:?}: expected PORT=IDENTIFIER")]
    InvalidRoute(String),
}

/// TCP route information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpRoute {
    pub port: u16,
    pub identifier: String,
}

impl TcpRoute {
    pub fn new(port: u16, identifier: impl Into<String>) -> Self {
        Self {
            port,
            identifier: identifier.into(),
        }
    }

    /// Parse the `PORT=IDENTIFIER` command-line form
    pub fn parse(text: &str) -> Result<Self, TcpRouterError> {
        let invalid = || TcpRouterError::InvalidRoute(text.to_string());

        let (port, identifier) = text.split_once('=').ok_or_else(invalid)?;
        let port: u16 = port.trim().parse().map_err(|_| invalid())?;
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(invalid());
        }

        Ok(Self::new(port, identifier))
    }
}

impl std::str::FromStr for TcpRoute {
    type Err = TcpRouterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// TCP router
pub struct TcpRouter<S> {
    registry: Arc<ClientRegistry<S>>,
    routes: DashMap<u16, String>,
}

impl<S> TcpRouter<S> {
    pub fn new(registry: Arc<ClientRegistry<S>>) -> Self {
        Self {
            registry,
            routes: DashMap::new(),
        }
    }

    /// Register a TCP route, replacing any previous route on the same port
    pub fn register_route(&self, route: TcpRoute) {
        debug!(
            "Registering TCP route: port {} -> {}",
            route.port, route.identifier
        );
        self.routes.insert(route.port, route.identifier);
    }

    /// Identifier bound to `port`, if any
    pub fn identifier_for(&self, port: u16) -> Option<String> {
        self.routes.get(&port).map(|entry| entry.value().clone())
    }

    /// Lookup the live session behind a port
    pub fn lookup(&self, port: u16) -> Result<(String, Arc<S>), TcpRouterError> {
        trace!("Looking up TCP route for port {}", port);

        let identifier = self
            .identifier_for(port)
            .ok_or(TcpRouterError::NoRoute(port))?;

        match self.registry.get(&identifier) {
            Some(session) => Ok((identifier, session)),
            None => Err(TcpRouterError::ClientNotFound { port, identifier }),
        }
    }
}
