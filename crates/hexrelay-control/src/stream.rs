//! One public connection multiplexed over a control channel
//!
//! A stream owns both halves of its public connection, but in two different
//! tasks: a writer task drains agent payloads into the write half, and the
//! session's relay task reads the read half (see [`crate::session`]). Closing
//! the stream stops the relay task and gives the writer [`CLOSE_FLUSH_TIMEOUT`]
//! to flush what is already queued; after that the connection is dropped
//! whether or not the peer is still reading.

use crate::ControlError;
use bytes::Bytes;
use hexrelay_proto::{Frame, StreamId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Payloads that may wait for a slow public peer before the stream is dropped
pub const STREAM_QUEUE_CAPACITY: usize = 64;

/// How long a closed stream may keep flushing queued payloads
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// How a public connection reached the relay; decides the announcement frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOrigin {
    /// Hijacked HTTP request, announced with `registered:<id>`
    Http,
    /// Raw TCP connection, announced with `start:<id>`
    Tcp,
}

impl StreamOrigin {
    pub fn announcement(&self, stream_id: StreamId) -> Frame {
        match self {
            StreamOrigin::Http => Frame::Registered { stream_id },
            StreamOrigin::Tcp => Frame::Start { stream_id },
        }
    }
}

/// Public end of a stream
pub struct PublicStream {
    id: StreamId,
    origin: StreamOrigin,
    payload_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl PublicStream {
    /// Create the stream and spawn the writer task that owns `writer`
    pub fn spawn<W>(id: StreamId, origin: StreamOrigin, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (payload_tx, payload_rx) = mpsc::channel(STREAM_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();

        tokio::spawn(write_to_public(id, writer, payload_rx, cancel.clone()));

        Self {
            id,
            origin,
            payload_tx: Mutex::new(Some(payload_tx)),
            cancel,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    /// Cancelled once the stream is closed or its public connection failed
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Queue bytes for the public connection
    ///
    /// Never waits on the public peer. A peer that lets [`STREAM_QUEUE_CAPACITY`]
    /// payloads pile up is cut off: the stream is cancelled and the relay task
    /// tears it down.
    pub async fn write(&self, payload: Bytes) -> Result<(), ControlError> {
        let payload_tx = self.payload_tx.lock().await;
        let tx = match payload_tx.as_ref() {
            Some(tx) if !self.cancel.is_cancelled() => tx,
            _ => return Err(ControlError::StreamClosed(self.id)),
        };

        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Stream {} public peer is not reading, dropping the connection",
                    self.id
                );
                self.cancel.cancel();
                Err(ControlError::StreamOverflow(self.id))
            }
            Err(TrySendError::Closed(_)) => Err(ControlError::StreamClosed(self.id)),
        }
    }

    /// Close the stream. Only the first call has an effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("Closing stream {}", self.id);
        self.cancel.cancel();
        // Dropping the sender ends the writer's queue once it is drained
        self.payload_tx.lock().await.take();
    }
}

/// Writer task: drain queued payloads into the public connection
///
/// Once the stream is cancelled the remaining queue gets
/// [`CLOSE_FLUSH_TIMEOUT`] to reach the peer; `writer` is dropped either way.
async fn write_to_public<W>(
    id: StreamId,
    mut writer: W,
    mut payload_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Send + Unpin,
{
    let drain = async {
        while let Some(payload) = payload_rx.recv().await {
            trace!("Writing {} bytes to stream {}", payload.len(), id);
            writer.write_all(&payload).await?;
        }
        writer.shutdown().await
    };
    tokio::pin!(drain);

    let finished = tokio::select! {
        result = &mut drain => Some(result),
        _ = cancel.cancelled() => tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut drain).await.ok(),
    };

    match finished {
        Some(Ok(())) => trace!("Stream {} writer finished", id),
        Some(Err(e)) => {
            debug!("Write to stream {} failed: {}", id, e);
            // Stop the read side too; the relay task then tears the stream down
            cancel.cancel();
        }
        None => debug!("Stream {} peer did not drain in time, dropping connection", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    /// Public peer that never accepts a byte; records when it is dropped
    struct StalledPeer {
        released: Arc<AtomicBool>,
    }

    impl AsyncWrite for StalledPeer {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl Drop for StalledPeer {
        fn drop(&mut self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    fn stalled_stream(id: StreamId) -> (PublicStream, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        let peer = StalledPeer {
            released: released.clone(),
        };
        (PublicStream::spawn(id, StreamOrigin::Http, peer), released)
    }

    #[test]
    fn test_announcement_frames() {
        assert_eq!(
            StreamOrigin::Http.announcement(4),
            Frame::Registered { stream_id: 4 }
        );
        assert_eq!(StreamOrigin::Tcp.announcement(4), Frame::Start { stream_id: 4 });
    }

    #[tokio::test]
    async fn test_writes_reach_public_side_in_order() {
        let (public, relay_side) = tokio::io::duplex(1024);
        let stream = PublicStream::spawn(2, StreamOrigin::Http, relay_side);

        stream.write(Bytes::from_static(b"HTTP/1.1 200 OK\r\n")).await.unwrap();
        stream.write(Bytes::from_static(b"\r\nhello")).await.unwrap();
        stream.close().await;

        let mut public = public;
        let mut received = Vec::new();
        public.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"HTTP/1.1 200 OK\r\n\r\nhello");
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (_public, relay_side) = tokio::io::duplex(64);
        let stream = PublicStream::spawn(3, StreamOrigin::Tcp, relay_side);
        let cancel = stream.cancellation();

        stream.close().await;
        stream.close().await;

        assert!(stream.is_closed());
        assert!(cancel.is_cancelled());
        assert!(matches!(
            stream.write(Bytes::from_static(b"late")).await,
            Err(ControlError::StreamClosed(3))
        ));
    }

    #[tokio::test]
    async fn test_write_failure_cancels_stream() {
        let (public, relay_side) = tokio::io::duplex(64);
        let stream = PublicStream::spawn(5, StreamOrigin::Tcp, relay_side);
        let cancel = stream.cancellation();

        drop(public);
        stream.write(Bytes::from_static(b"nobody listening")).await.unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), cancel.cancelled())
            .await
            .expect("stream should be cancelled after a failed write");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_connection_of_stalled_peer() {
        let (stream, released) = stalled_stream(2);

        for _ in 0..8 {
            stream.write(Bytes::from(vec![0u8; 100 * 1024])).await.unwrap();
        }
        stream.close().await;

        tokio::time::sleep(CLOSE_FLUSH_TIMEOUT + Duration::from_secs(1)).await;
        for _ in 0..10 {
            if released.load(Ordering::SeqCst) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(released.load(Ordering::SeqCst), "connection still held after close");
    }

    #[tokio::test]
    async fn test_queue_overflow_cuts_off_stalled_peer() {
        let (stream, _released) = stalled_stream(4);
        let cancel = stream.cancellation();
        let mut accepted = 0;

        let mut overflowed = false;
        for _ in 0..STREAM_QUEUE_CAPACITY + 2 {
            match stream.write(Bytes::from_static(b"chunk")).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    assert!(matches!(e, ControlError::StreamOverflow(4)));
                    overflowed = true;
                    break;
                }
            }
        }

        assert!(overflowed);
        assert!(accepted <= STREAM_QUEUE_CAPACITY + 1);
        assert!(cancel.is_cancelled());
        assert!(matches!(
            stream.write(Bytes::from_static(b"late")).await,
            Err(ControlError::StreamClosed(4))
        ));
    }
}
