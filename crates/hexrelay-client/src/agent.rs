//! Agent side of the control channel

use crate::config::AgentConfig;
use crate::tls;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::StreamExt;
use hexrelay_control::{FrameSink, WebSocketSink};
use hexrelay_proto::{Frame, FrameError, StreamId, RELAY_CHUNK_SIZE, TOKEN_HEADER};
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = WebSocketSink<SplitSink<WsStream, Message>>;

/// Agent errors
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Unsupported relay URL scheme {0:?} (expected ws or wss)")]
    UnsupportedScheme(String),

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Relay rejected registration ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("Connection to relay failed: {0}")]
    ConnectionFailed(#[source] tungstenite::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
}

/// Tunnel agent
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Register with the relay
    pub async fn connect(&self) -> Result<AgentConnection, AgentError> {
        let url = self.config.registration_url()?;
        info!(
            "Connecting to relay {} as {}",
            self.config.relay_url,
            self.config.effective_identifier()
        );

        let connector = match url.scheme() {
            "ws" => None,
            "wss" if self.config.insecure => {
                warn!("TLS certificate verification is disabled");
                Some(tls::insecure_connector())
            }
            "wss" => {
                tls::ensure_crypto_provider();
                None
            }
            other => return Err(AgentError::UnsupportedScheme(other.to_string())),
        };

        let mut request = url.as_str().into_client_request()?;
        let token = HeaderValue::from_str(&self.config.token)
            .map_err(|e| AgentError::InvalidToken(e.to_string()))?;
        request.headers_mut().insert(TOKEN_HEADER, token);

        let connected =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector).await;
        let (ws, _response) = match connected {
            Ok(connected) => connected,
            Err(tungstenite::Error::Http(response)) => {
                let reason = response
                    .body()
                    .as_ref()
                    .map(|body| String::from_utf8_lossy(body).trim().to_string())
                    .unwrap_or_default();
                return Err(AgentError::Rejected {
                    status: response.status().as_u16(),
                    reason,
                });
            }
            Err(e) => return Err(AgentError::ConnectionFailed(e)),
        };

        info!("Tunnel registered: local {}", self.config.local_addr);
        if let Some(public_url) = self.config.public_url() {
            info!("Public URL: {}", public_url);
        }

        Ok(AgentConnection {
            ws,
            config: self.config.clone(),
        })
    }

    /// Connect and serve until the relay closes the channel
    pub async fn run(&self) -> Result<(), AgentError> {
        self.connect().await?.run().await
    }
}

/// Local end of one stream, owned by the receive loop
struct LocalStream {
    payload_tx: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
}

/// An established control channel
pub struct AgentConnection {
    ws: WsStream,
    config: Arc<AgentConfig>,
}

impl AgentConnection {
    /// Serve streams until the control channel closes
    ///
    /// Every local connection is closed on return.
    pub async fn run(self) -> Result<(), AgentError> {
        let (sink, mut source) = self.ws.split();
        let sink: Arc<WsSink> = Arc::new(WebSocketSink::new(sink));
        let mut streams: HashMap<StreamId, LocalStream> = HashMap::new();
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<StreamId>();

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.tick().await;

        let result = loop {
            tokio::select! {
                message = source.next() => {
                    let text = match message {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(_) => {
                                warn!("Discarding non UTF-8 binary frame");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            info!("Relay closed the control channel: {:?}", frame);
                            break Ok(());
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Err(AgentError::WebSocket(e)),
                        None => break Ok(()),
                    };

                    match Frame::parse(&text) {
                        Ok(frame) => {
                            handle_frame(frame, &mut streams, &self.config, &sink, &ended_tx).await;
                        }
                        Err(FrameError::UnknownType(kind)) => {
                            debug!("Ignoring frame of type {:?}", kind);
                        }
                        Err(e) => warn!("Discarding frame: {}", e),
                    }
                }
                Some(stream_id) = ended_rx.recv() => {
                    if streams.remove(&stream_id).is_some() {
                        trace!("Stream {} finished", stream_id);
                    }
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.ping().await {
                        debug!("Keepalive ping failed: {}", e);
                    }
                }
            }
        };

        let open = streams.len();
        for (_, stream) in streams.drain() {
            stream.cancel.cancel();
        }
        sink.close().await;
        info!("Control channel closed ({} local streams closed)", open);

        result
    }
}

async fn handle_frame(
    frame: Frame,
    streams: &mut HashMap<StreamId, LocalStream>,
    config: &Arc<AgentConfig>,
    sink: &Arc<WsSink>,
    ended_tx: &mpsc::UnboundedSender<StreamId>,
) {
    match frame {
        Frame::Registered { stream_id } | Frame::Start { stream_id } => {
            if streams.contains_key(&stream_id) {
                warn!("Stream {} announced twice, ignoring", stream_id);
                return;
            }
            debug!("New stream {}", stream_id);

            let (payload_tx, payload_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            streams.insert(
                stream_id,
                LocalStream {
                    payload_tx,
                    cancel: cancel.clone(),
                },
            );

            tokio::spawn(serve_local_stream(
                stream_id,
                config.local_addr.clone(),
                payload_rx,
                cancel,
                sink.clone(),
                ended_tx.clone(),
            ));
        }
        Frame::Msg { stream_id, payload } => match streams.get(&stream_id) {
            Some(stream) => {
                let _ = stream.payload_tx.send(payload);
            }
            None => {
                debug!("Payload for unknown stream {}, replying close", stream_id);
                let _ = sink.send_frame(&Frame::close(stream_id)).await;
            }
        },
        Frame::Close { stream_id } => {
            if let Some(stream) = streams.remove(&stream_id) {
                debug!("Relay closed stream {}", stream_id);
                stream.cancel.cancel();
            }
        }
    }
}

/// One stream: local connection <-> control channel
///
/// Payloads queued before the local connection is up are written once it is.
async fn serve_local_stream(
    stream_id: StreamId,
    local_addr: String,
    mut payload_rx: mpsc::UnboundedReceiver<Bytes>,
    cancel: CancellationToken,
    sink: Arc<WsSink>,
    ended_tx: mpsc::UnboundedSender<StreamId>,
) {
    let socket = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = ended_tx.send(stream_id);
            return;
        }
        connected = TcpStream::connect(&local_addr) => connected,
    };

    let socket = match socket {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Stream {}: failed to connect to {}: {}", stream_id, local_addr, e);
            let _ = sink.send_frame(&Frame::close(stream_id)).await;
            let _ = ended_tx.send(stream_id);
            return;
        }
    };
    trace!("Stream {} connected to {}", stream_id, local_addr);

    let (mut reader, mut writer) = socket.into_split();

    let write_local = async move {
        while let Some(payload) = payload_rx.recv().await {
            if let Err(e) = writer.write_all(&payload).await {
                debug!("Stream {}: local write failed: {}", stream_id, e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    };

    let read_local = async {
        let mut buffer = vec![0u8; RELAY_CHUNK_SIZE];
        // true when the local side ended the stream
        let local_ended = loop {
            let read = tokio::select! {
                _ = cancel.cancelled() => break false,
                read = reader.read(&mut buffer) => read,
            };
            match read {
                Ok(0) => break true,
                Ok(n) => {
                    let frame = Frame::msg(stream_id, Bytes::copy_from_slice(&buffer[..n]));
                    if sink.send_frame(&frame).await.is_err() {
                        break false;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    debug!("Stream {}: local read failed: {}", stream_id, e);
                    break true;
                }
            }
        };

        if local_ended {
            let _ = sink.send_frame(&Frame::close(stream_id)).await;
        }
        // Lets the receive loop drop the payload sender, ending write_local
        let _ = ended_tx.send(stream_id);
    };

    tokio::join!(write_local, read_local);
    trace!("Stream {} done", stream_id);
}
