//! HTTP server implementation

use crate::head::{read_request_head, HeadError, MAX_HEAD_SIZE};
use bytes::Bytes;
use hexrelay_control::{ClientSession, StreamOrigin};
use hexrelay_router::{HttpRouter, HttpRouterError};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// HTTP server errors
#[derive(Debug, Error)]
pub enum HttpServerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}\n\nTroubleshooting:\n  • Check if another process is using this port: lsof -i :{port}\n  • Try using a different address or port")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },

    #[error("Request head error: {0}")]
    Head(#[from] HeadError),

    #[error("Failed to open stream: {0}")]
    Control(#[from] hexrelay_control::ControlError),
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Bytes read while looking for the end of the request head
    pub max_head_size: usize,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5000)),
            max_head_size: MAX_HEAD_SIZE,
        }
    }
}

impl HttpServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_max_head_size(mut self, max_head_size: usize) -> Self {
        self.max_head_size = max_head_size;
        self
    }
}

/// Public HTTP server
pub struct HttpServer {
    config: HttpServerConfig,
    router: Arc<HttpRouter<ClientSession>>,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, router: Arc<HttpRouter<ClientSession>>) -> Self {
        Self { config, router }
    }

    pub async fn bind(&self) -> Result<TcpListener, HttpServerError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| HttpServerError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })
    }

    /// Start the HTTP server
    pub async fn start(self: Arc<Self>) -> Result<(), HttpServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), HttpServerError> {
        let local_addr = listener.local_addr()?;
        info!("HTTP server listening on {}", local_addr);

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted HTTP connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(socket).await {
                            debug!("HTTP connection from {} ended: {}", peer_addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Route one public connection and hand it to the owning session
    async fn handle_connection(&self, mut socket: TcpStream) -> Result<(), HttpServerError> {
        let (head, buffered) =
            match read_request_head(&mut socket, self.config.max_head_size).await {
                Ok(read) => read,
                Err(HeadError::Closed) => return Ok(()),
                Err(e @ (HeadError::Invalid(_) | HeadError::TooLarge(_) | HeadError::Truncated)) => {
                    warn!("Rejecting malformed request: {}", e);
                    let _ = write_error(&mut socket, 400, "Bad Request", "bad request").await;
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            };

        debug!(
            "{} {} for host {:?} (override {:?})",
            head.method, head.path, head.host, head.override_host
        );

        let (identifier, session) = match self
            .router
            .lookup(head.host.as_deref(), head.override_host.as_deref())
        {
            Ok(route) => route,
            Err(e) => {
                debug!("No route for request: {:?}", e);
                let message = match &e {
                    HttpRouterError::NoRoutingHost => "no token host",
                    HttpRouterError::ClientNotFound(_) => "client not found for host",
                };
                write_error(&mut socket, 404, "Not Found", message).await?;
                return Ok(());
            }
        };

        let (reader, writer) = socket.into_split();
        let stream_id = session
            .open_stream(StreamOrigin::Http, reader, writer, Bytes::from(buffered))
            .await?;

        debug!(
            identifier = %identifier,
            stream_id,
            "Hijacked HTTP connection ({} byte head)",
            head.head_len
        );
        Ok(())
    }
}

/// Plain-text error response, then close
async fn write_error(
    socket: &mut TcpStream,
    status: u16,
    reason: &str,
    message: &str,
) -> std::io::Result<()> {
    let body = format!("{}\n", message);
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nX-Content-Type-Options: nosniff\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}
