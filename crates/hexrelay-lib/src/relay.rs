//! Relay builder and runner

use hexrelay_auth::{CredentialValidator, StoreValidator, TokenStore, DEFAULT_TOKENS_PATH};
use hexrelay_control::{ControlConfig, ControlHandler, SessionRegistry};
use hexrelay_router::{HttpRouter, SubdomainResolver, TcpRoute, TcpRouter};
use hexrelay_server_http::{HttpServer, HttpServerConfig};
use hexrelay_server_tcp::{TcpServer, TcpServerConfig};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{error, info};

/// Default subdomain suffix for public HTTP routing
pub const DEFAULT_SUFFIX: &str = "-hexrelay";

/// Relay builder errors
#[derive(Error, Debug)]
pub enum RelayBuilderError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    BindError(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

fn parse_addr(addr: &str) -> Result<SocketAddr, RelayBuilderError> {
    addr.parse()
        .map_err(|e| RelayBuilderError::ParseError(format!("Invalid address {:?}: {}", addr, e)))
}

/// Builder for a [`Relay`]
pub struct RelayBuilder {
    control_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    tcp_routes: Vec<TcpRoute>,
    tokens_path: PathBuf,
    validator: Option<Arc<dyn CredentialValidator>>,
    suffix: String,
}

impl Default for RelayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayBuilder {
    pub fn new() -> Self {
        Self {
            control_addr: ControlConfig::default().bind_addr,
            http_addr: Some(HttpServerConfig::default().bind_addr),
            tcp_routes: Vec::new(),
            tokens_path: PathBuf::from(DEFAULT_TOKENS_PATH),
            validator: None,
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }

    /// Address of the agent registration endpoint
    pub fn control_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.control_addr = parse_addr(addr)?;
        Ok(self)
    }

    /// Address of the public HTTP listener
    pub fn http_addr(mut self, addr: &str) -> Result<Self, RelayBuilderError> {
        self.http_addr = Some(parse_addr(addr)?);
        Ok(self)
    }

    /// Run without a public HTTP listener
    pub fn without_http(mut self) -> Self {
        self.http_addr = None;
        self
    }

    /// Expose `identifier` on public raw TCP `port` (0 picks a free port)
    pub fn tcp_route(mut self, port: u16, identifier: impl Into<String>) -> Self {
        self.tcp_routes.push(TcpRoute::new(port, identifier));
        self
    }

    pub fn tokens_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.tokens_path = path.into();
        self
    }

    /// Use a custom validator instead of the token file
    pub fn validator(mut self, validator: Arc<dyn CredentialValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Subdomain suffix for HTTP routing; empty disables suffix matching
    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = suffix.into();
        self
    }

    pub fn build(self) -> Result<Relay, RelayBuilderError> {
        let mut ports = HashSet::new();
        for route in &self.tcp_routes {
            if route.identifier.is_empty() {
                return Err(RelayBuilderError::ConfigError(format!(
                    "TCP route on port {} has an empty identifier",
                    route.port
                )));
            }
            if route.port != 0 && !ports.insert(route.port) {
                return Err(RelayBuilderError::ConfigError(format!(
                    "TCP port {} is routed more than once",
                    route.port
                )));
            }
        }

        let validator = self.validator.unwrap_or_else(|| {
            Arc::new(StoreValidator::new(TokenStore::new(self.tokens_path.clone())))
        });

        let registry = Arc::new(SessionRegistry::new());

        let control = Arc::new(ControlHandler::new(
            ControlConfig::default().with_bind_addr(self.control_addr),
            registry.clone(),
            validator,
        ));

        let http = self.http_addr.map(|bind_addr| {
            let router = Arc::new(HttpRouter::new(
                registry.clone(),
                SubdomainResolver::new(self.suffix.clone()),
            ));
            Arc::new(HttpServer::new(
                HttpServerConfig::default().with_bind_addr(bind_addr),
                router,
            ))
        });

        let tcp_router = Arc::new(TcpRouter::new(registry.clone()));
        let tcp = self
            .tcp_routes
            .iter()
            .map(|route| {
                let config = TcpServerConfig::new(
                    SocketAddr::new(self.control_addr.ip(), route.port),
                    route.identifier.clone(),
                );
                Arc::new(TcpServer::new(config, tcp_router.clone()))
            })
            .collect();

        Ok(Relay {
            registry,
            control,
            http,
            tcp,
        })
    }
}

/// A configured relay, not yet listening
pub struct Relay {
    registry: Arc<SessionRegistry>,
    control: Arc<ControlHandler>,
    http: Option<Arc<HttpServer>>,
    tcp: Vec<Arc<TcpServer>>,
}

impl Relay {
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    /// Bind every listener. Any bind failure is returned and nothing is served.
    pub async fn bind(self) -> Result<BoundRelay, RelayBuilderError> {
        let control_listener = self
            .control
            .bind()
            .await
            .map_err(|e| RelayBuilderError::BindError(e.to_string()))?;
        let control_addr = control_listener.local_addr()?;

        let http = match self.http {
            Some(server) => {
                let listener = server
                    .bind()
                    .await
                    .map_err(|e| RelayBuilderError::BindError(e.to_string()))?;
                Some((server, listener))
            }
            None => None,
        };
        let http_addr = match &http {
            Some((_, listener)) => Some(listener.local_addr()?),
            None => None,
        };

        let mut tcp = Vec::with_capacity(self.tcp.len());
        let mut tcp_addrs = Vec::with_capacity(self.tcp.len());
        for server in self.tcp {
            let listener = server
                .bind()
                .await
                .map_err(|e| RelayBuilderError::BindError(e.to_string()))?;
            tcp_addrs.push(listener.local_addr()?);
            tcp.push((server, listener));
        }

        Ok(BoundRelay {
            registry: self.registry,
            control: (self.control, control_listener),
            http,
            tcp,
            control_addr,
            http_addr,
            tcp_addrs,
        })
    }

    /// Bind and serve until a listener fails
    pub async fn run(self) -> Result<(), RelayBuilderError> {
        self.bind().await?.run().await
    }
}

/// A relay with all listeners bound
pub struct BoundRelay {
    registry: Arc<SessionRegistry>,
    control: (Arc<ControlHandler>, TcpListener),
    http: Option<(Arc<HttpServer>, TcpListener)>,
    tcp: Vec<(Arc<TcpServer>, TcpListener)>,
    control_addr: SocketAddr,
    http_addr: Option<SocketAddr>,
    tcp_addrs: Vec<SocketAddr>,
}

impl BoundRelay {
    pub fn registry(&self) -> Arc<SessionRegistry> {
        self.registry.clone()
    }

    pub fn control_addr(&self) -> SocketAddr {
        self.control_addr
    }

    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http_addr
    }

    /// Bound TCP listener addresses, in the order routes were added
    pub fn tcp_addrs(&self) -> &[SocketAddr] {
        &self.tcp_addrs
    }

    /// Serve until the first listener stops
    pub async fn run(self) -> Result<(), RelayBuilderError> {
        let mut join_set = JoinSet::new();

        let (control, listener) = self.control;
        join_set.spawn(async move { control.serve(listener).await.map_err(|e| e.to_string()) });

        if let Some((server, listener)) = self.http {
            join_set.spawn(async move { server.serve(listener).await.map_err(|e| e.to_string()) });
        }

        for (server, listener) in self.tcp {
            join_set.spawn(async move { server.serve(listener).await.map_err(|e| e.to_string()) });
        }

        info!(
            "Relay running: control {}, http {:?}, tcp {:?}",
            self.control_addr, self.http_addr, self.tcp_addrs
        );

        match join_set.join_next().await {
            Some(Ok(Ok(()))) | None => Ok(()),
            Some(Ok(Err(e))) => {
                error!("Listener failed: {}", e);
                Err(RelayBuilderError::ServerError(e))
            }
            Some(Err(e)) => Err(RelayBuilderError::ServerError(format!(
                "Listener task failed: {}",
                e
            ))),
        }
    }
}
