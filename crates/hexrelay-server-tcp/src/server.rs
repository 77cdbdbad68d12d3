//! TCP server implementation
//!
//! Each server owns one public port bound to a fixed routing identifier. Nothing
//! is read from the connection before it is handed to the session, so streams
//! are announced with `start:<id>` and carry no initial payload.

use bytes::Bytes;
use hexrelay_control::{ClientSession, StreamOrigin};
use hexrelay_router::{TcpRoute, TcpRouter, TcpRouterError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// TCP server errors
#[derive(Debug, Error)]
pub enum TcpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Route error: {0}")]
    Route(#[from] TcpRouterError),

    #[error("Failed to open stream: {0}")]
    Control(#[from] hexrelay_control::ControlError),
}

/// TCP server configuration
#[derive(Debug, Clone)]
pub struct TcpServerConfig {
    pub bind_addr: SocketAddr,
    /// Routing identifier every connection on this port goes to
    pub identifier: String,
}

impl TcpServerConfig {
    pub fn new(bind_addr: SocketAddr, identifier: impl Into<String>) -> Self {
        Self {
            bind_addr,
            identifier: identifier.into(),
        }
    }

    /// Listen on all interfaces at `port`
    pub fn for_route(route: &TcpRoute) -> Self {
        Self::new(SocketAddr::from(([0, 0, 0, 0], route.port)), route.identifier.clone())
    }
}

/// Public raw TCP server
pub struct TcpServer {
    config: TcpServerConfig,
    router: Arc<TcpRouter<ClientSession>>,
}

impl TcpServer {
    pub fn new(config: TcpServerConfig, router: Arc<TcpRouter<ClientSession>>) -> Self {
        Self { config, router }
    }

    /// Bind the port and register its route under the port actually bound
    pub async fn bind(&self) -> Result<TcpListener, TcpServerError> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| TcpServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })?;

        let port = listener.local_addr()?.port();
        self.router
            .register_route(TcpRoute::new(port, self.config.identifier.clone()));

        Ok(listener)
    }

    /// Start the TCP server
    pub async fn start(self: Arc<Self>) -> Result<(), TcpServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TcpServerError> {
        let local_addr = listener.local_addr()?;
        info!(
            "TCP server listening on {} -> {}",
            local_addr, self.config.identifier
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted TCP connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket, local_addr.port()).await {
                            debug!("Dropping TCP connection from {}: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    async fn handle_connection(&self, socket: TcpStream, port: u16) -> Result<(), TcpServerError> {
        // An unknown identifier drops the socket, closing the connection
        let (identifier, session) = self.router.lookup(port)?;

        let (reader, writer) = socket.into_split();
        let stream_id = session
            .open_stream(StreamOrigin::Tcp, reader, writer, Bytes::new())
            .await?;

        debug!(identifier = %identifier, stream_id, "Accepted raw TCP stream");
        Ok(())
    }
}
