//! Outbound half of a control channel

use crate::ControlError;
use async_trait::async_trait;
use futures_util::{Sink, SinkExt};
use hexrelay_proto::Frame;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, trace};

/// Serialized writer of frames to one agent
///
/// Implementations must accept concurrent callers and never interleave two frames.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &Frame) -> Result<(), ControlError>;

    /// Close the channel. Calling it more than once is harmless.
    async fn close(&self);
}

/// [`FrameSink`] over the write half of a WebSocket
///
/// Each frame is one text message. A single mutex guards the underlying sink,
/// separate from any stream bookkeeping lock.
pub struct WebSocketSink<S> {
    sink: Mutex<S>,
    closed: AtomicBool,
}

impl<S> WebSocketSink<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }
}

impl<S> WebSocketSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Send + Unpin,
{
    /// Keepalive ping, serialized with frame writes
    pub async fn ping(&self) -> Result<(), ControlError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControlError::ChannelClosed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(Message::Ping(Vec::new())).await?;
        Ok(())
    }
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: Sink<Message, Error = tungstenite::Error> + Send + Unpin,
{
    async fn send_frame(&self, frame: &Frame) -> Result<(), ControlError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ControlError::ChannelClosed);
        }

        trace!("Sending frame {:?} ({})", frame.kind(), frame.stream_id());

        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.encode())).await?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!("Error closing control channel: {}", e);
        }
    }
}

/// In-process [`FrameSink`] delivering frames to an mpsc receiver
///
/// Lets a session be driven without a network connection.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Frame>,
    closed: AtomicBool,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl FrameSink for ChannelSink {
    async fn send_frame(&self, frame: &Frame) -> Result<(), ControlError> {
        if self.is_closed() {
            return Err(ControlError::ChannelClosed);
        }
        self.tx
            .send(frame.clone())
            .map_err(|_| ControlError::ChannelClosed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
