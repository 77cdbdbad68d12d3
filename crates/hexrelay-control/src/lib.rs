//! Control plane for tunnel agents
//!
//! A [`ClientSession`] is one authenticated agent: its control channel (a
//! [`FrameSink`]) plus the public streams currently multiplexed over it. The
//! [`ControlHandler`] accepts agents on the `/register` WebSocket endpoint and
//! runs each session's receive loop.

pub mod handler;
pub mod registration;
pub mod session;
pub mod sink;
pub mod stream;

use hexrelay_proto::StreamId;
use thiserror::Error;

pub use handler::{ControlConfig, ControlHandler};
pub use registration::{authorize_registration, RegistrationError};
pub use session::{ClientSession, SessionRegistry};
pub use sink::{ChannelSink, FrameSink, WebSocketSink};
pub use stream::{PublicStream, StreamOrigin, CLOSE_FLUSH_TIMEOUT, STREAM_QUEUE_CAPACITY};

/// Control plane errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("Stream {0} queue is full")]
    StreamOverflow(StreamId),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to bind to {address}:{port}: {reason}")]
    BindError {
        address: String,
        port: u16,
        reason: String,
    },
}
