//! Control channel handler
//!
//! Accepts agents on the registration endpoint, upgrades them to WebSocket,
//! registers a [`ClientSession`] and runs its receive loop until the channel closes.

use crate::registration::{authorize_registration, RegistrationError};
use crate::session::{ClientSession, SessionRegistry};
use crate::sink::WebSocketSink;
use crate::ControlError;
use futures_util::{Stream, StreamExt};
use hexrelay_auth::CredentialValidator;
use hexrelay_proto::REGISTER_PATH;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, warn};

/// Control channel configuration
#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub bind_addr: SocketAddr,
    /// Registration endpoint path
    pub path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8888)),
            path: REGISTER_PATH.to_string(),
        }
    }
}

impl ControlConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Accepts and serves agent control channels
pub struct ControlHandler {
    config: ControlConfig,
    registry: Arc<SessionRegistry>,
    validator: Arc<dyn CredentialValidator>,
}

impl ControlHandler {
    pub fn new(
        config: ControlConfig,
        registry: Arc<SessionRegistry>,
        validator: Arc<dyn CredentialValidator>,
    ) -> Self {
        Self {
            config,
            registry,
            validator,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Bind the configured address
    pub async fn bind(&self) -> Result<TcpListener, ControlError> {
        TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| ControlError::BindError {
                address: self.config.bind_addr.ip().to_string(),
                port: self.config.bind_addr.port(),
                reason: e.to_string(),
            })
    }

    /// Bind and serve forever
    pub async fn start(self: Arc<Self>) -> Result<(), ControlError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept agents on an already-bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), ControlError> {
        let local_addr = listener.local_addr()?;
        info!(
            "Control channel listening on ws://{}{}",
            local_addr, self.config.path
        );

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Incoming control connection from {}", peer_addr);
                    let handler = self.clone();
                    tokio::spawn(async move {
                        handler.handle_connection(socket, peer_addr).await;
                    });
                }
                Err(e) => {
                    error!("Failed to accept control connection: {}", e);
                }
            }
        }
    }

    /// Handshake, register, then run the session until the channel closes
    pub async fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let mut outcome: Option<Result<String, RegistrationError>> = None;
        let path = self.config.path.as_str();
        let validator = self.validator.as_ref();

        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            let result = authorize_registration(request, path, validator);
            let reply = match &result {
                Ok(_) => Ok(response),
                Err(e) => Err(e.to_response()),
            };
            outcome = Some(result);
            reply
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(socket, callback).await {
            Ok(stream) => stream,
            Err(e) => {
                match outcome {
                    Some(Err(RegistrationError::StoreUnavailable(cause))) => {
                        error!("Rejected agent {}: token store unavailable: {}", peer_addr, cause);
                    }
                    Some(Err(reason)) => {
                        warn!("Rejected agent {}: {}", peer_addr, reason);
                    }
                    _ => {
                        warn!("WebSocket handshake failed from {}: {}", peer_addr, e);
                    }
                }
                return;
            }
        };

        let identifier = match outcome {
            Some(Ok(identifier)) => identifier,
            _ => {
                error!("Handshake from {} completed without registration", peer_addr);
                return;
            }
        };

        let (sink, source) = ws_stream.split();
        let session = Arc::new(ClientSession::new(
            identifier.clone(),
            Arc::new(WebSocketSink::new(sink)),
        ));
        self.registry.set(identifier.clone(), session.clone());

        info!(identifier = %identifier, "Client registered from {}", peer_addr);

        run_session(&session, source).await;
        session.shutdown(&self.registry).await;
    }
}

/// Receive loop: one frame at a time until close or read error
pub async fn run_session<S>(session: &Arc<ClientSession>, mut source: S)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(message) = source.next().await {
        match message {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => session.handle_text(&text).await,
                Err(_) => warn!(
                    identifier = %session.identifier(),
                    "Discarding non UTF-8 binary frame"
                ),
            },
            Ok(Message::Close(frame)) => {
                debug!(identifier = %session.identifier(), "Control channel closed: {:?}", frame);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                debug!(identifier = %session.identifier(), "Control channel read failed: {}", e);
                break;
            }
        }
    }
}
