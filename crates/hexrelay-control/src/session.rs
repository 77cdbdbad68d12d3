//! Client session: one connected agent and its open streams

use crate::sink::FrameSink;
use crate::stream::{PublicStream, StreamOrigin};
use crate::ControlError;
use bytes::Bytes;
use hexrelay_proto::{Frame, FrameError, StreamId, INITIAL_STREAM_COUNTER, RELAY_CHUNK_SIZE};
use hexrelay_router::ClientRegistry;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Registry of live sessions, shared by the control handler and public listeners
pub type SessionRegistry = ClientRegistry<ClientSession>;

/// One authenticated, connected tunnel agent
pub struct ClientSession {
    identifier: String,
    sink: Arc<dyn FrameSink>,
    streams: RwLock<HashMap<StreamId, Arc<PublicStream>>>,
    next_stream_id: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("identifier", &self.identifier)
            .field("next_stream_id", &self.next_stream_id)
            .field("closed", &self.closed)
            .finish()
    }
}

impl ClientSession {
    pub fn new(identifier: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            identifier: identifier.into(),
            sink,
            streams: RwLock::new(HashMap::new()),
            next_stream_id: AtomicU64::new(INITIAL_STREAM_COUNTER),
            closed: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Send one frame on the control channel
    pub async fn send(&self, frame: &Frame) -> Result<(), ControlError> {
        self.sink.send_frame(frame).await
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.read().await.len()
    }

    /// Ids of open streams, ascending
    pub async fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<StreamId> = self.streams.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub async fn get_stream(&self, stream_id: StreamId) -> Option<Arc<PublicStream>> {
        self.streams.read().await.get(&stream_id).cloned()
    }

    /// Take a public connection into this session
    ///
    /// Assigns the next stream id, registers the stream, sends the announcement
    /// and then `initial` (if non-empty) as the first `msg`, and finally spawns the
    /// relay task reading `reader`.
    pub async fn open_stream<R, W>(
        self: &Arc<Self>,
        origin: StreamOrigin,
        reader: R,
        writer: W,
        initial: Bytes,
    ) -> Result<StreamId, ControlError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::AcqRel) + 1;
        let stream = Arc::new(PublicStream::spawn(stream_id, origin, writer));

        {
            let mut streams = self.streams.write().await;
            // Checked under the map lock so shutdown cannot miss this stream
            if self.is_closed() {
                drop(streams);
                stream.close().await;
                return Err(ControlError::ChannelClosed);
            }
            streams.insert(stream_id, stream.clone());
        }

        debug!(
            identifier = %self.identifier,
            stream_id,
            "Opened {:?} stream",
            origin
        );

        let announced = async {
            self.send(&origin.announcement(stream_id)).await?;
            if !initial.is_empty() {
                self.send(&Frame::msg(stream_id, initial)).await?;
            }
            Ok::<_, ControlError>(())
        }
        .await;

        if let Err(e) = announced {
            warn!(
                identifier = %self.identifier,
                stream_id,
                "Failed to announce stream: {}",
                e
            );
            self.remove_stream(stream_id).await;
            return Err(e);
        }

        tokio::spawn(relay_public_to_agent(
            Arc::clone(self),
            stream_id,
            reader,
            stream.cancellation(),
        ));

        Ok(stream_id)
    }

    /// Handle one inbound text frame from the agent
    ///
    /// Protocol errors are logged and the frame is dropped; the control channel
    /// stays up.
    pub async fn handle_text(&self, text: &str) {
        trace!(identifier = %self.identifier, "Received frame: {:.64}", text);

        match Frame::parse(text) {
            Ok(frame) => self.handle_frame(frame).await,
            Err(FrameError::Malformed(_)) => {
                debug!(identifier = %self.identifier, "Discarding malformed frame");
            }
            Err(FrameError::UnknownType(kind)) => {
                debug!(identifier = %self.identifier, "Ignoring frame of type {:?}", kind);
            }
            Err(e) => {
                warn!(identifier = %self.identifier, "Discarding frame: {}", e);
            }
        }
    }

    pub async fn handle_frame(&self, frame: Frame) {
        match frame {
            Frame::Msg { stream_id, payload } => match self.get_stream(stream_id).await {
                Some(stream) => {
                    if let Err(e) = stream.write(payload).await {
                        debug!(
                            identifier = %self.identifier,
                            stream_id,
                            "Dropping payload: {}",
                            e
                        );
                    }
                }
                None => {
                    debug!(
                        identifier = %self.identifier,
                        stream_id,
                        "Payload for unknown stream, replying close"
                    );
                    let _ = self.send(&Frame::close(stream_id)).await;
                }
            },
            Frame::Close { stream_id } => {
                if self.remove_stream(stream_id).await {
                    debug!(identifier = %self.identifier, stream_id, "Agent closed stream");
                }
            }
            Frame::Registered { stream_id } | Frame::Start { stream_id } => {
                debug!(
                    identifier = %self.identifier,
                    stream_id,
                    "Ignoring announcement sent by agent"
                );
            }
        }
    }

    /// Remove and close a stream; returns whether it was present
    pub async fn remove_stream(&self, stream_id: StreamId) -> bool {
        let stream = self.streams.write().await.remove(&stream_id);
        match stream {
            Some(stream) => {
                stream.close().await;
                true
            }
            None => false,
        }
    }

    /// Single exit path of a relay task: remove the stream, tell the agent
    async fn finish_stream(&self, stream_id: StreamId) {
        self.remove_stream(stream_id).await;
        if !self.is_closed() {
            let _ = self.send(&Frame::close(stream_id)).await;
        }
    }

    /// Tear the session down
    ///
    /// Closes every stream and the control channel, then evicts the session from
    /// `registry` if it is still the holder of its identifier. Idempotent.
    pub async fn shutdown(self: &Arc<Self>, registry: &SessionRegistry) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let streams: Vec<Arc<PublicStream>> = {
            let mut streams = self.streams.write().await;
            streams.drain().map(|(_, stream)| stream).collect()
        };
        let closed_streams = streams.len();
        for stream in streams {
            stream.close().await;
        }

        self.sink.close().await;
        registry.delete(&self.identifier, self);

        info!(
            identifier = %self.identifier,
            "Client disconnected ({} streams closed)",
            closed_streams
        );
    }
}

/// Relay task: public connection -> `msg` frames
///
/// Reads up to [`RELAY_CHUNK_SIZE`] bytes at a time until end of stream, a
/// non-transient error, or cancellation. Timeouts are retried.
async fn relay_public_to_agent<R>(
    session: Arc<ClientSession>,
    stream_id: StreamId,
    mut reader: R,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; RELAY_CHUNK_SIZE];

    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                trace!("Stream {} cancelled", stream_id);
                break;
            }
            read = reader.read(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                debug!("Stream {} reached end of stream", stream_id);
                break;
            }
            Ok(n) => {
                let frame = Frame::msg(stream_id, Bytes::copy_from_slice(&buffer[..n]));
                if let Err(e) = session.send(&frame).await {
                    debug!("Stream {} could not forward {} bytes: {}", stream_id, n, e);
                    break;
                }
            }
            Err(e) if is_transient(&e) => {
                trace!("Transient read error on stream {}: {}", stream_id, e);
                continue;
            }
            Err(e) if is_closed_connection(&e) => {
                debug!("Stream {} connection closed: {}", stream_id, e);
                break;
            }
            Err(e) => {
                warn!("Stream {} read failed: {}", stream_id, e);
                break;
            }
        }
    }

    session.finish_stream(stream_id).await;
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

fn is_closed_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::ChannelSink;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    fn create_session(identifier: &str) -> (Arc<ClientSession>, mpsc::UnboundedReceiver<Frame>) {
        let (sink, rx) = ChannelSink::new();
        (Arc::new(ClientSession::new(identifier, Arc::new(sink))), rx)
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Frame {
        tokio::time::timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("sink dropped")
    }

    /// Open a stream backed by an in-memory pipe; returns the public end
    async fn open(
        session: &Arc<ClientSession>,
        origin: StreamOrigin,
        initial: &'static [u8],
    ) -> (StreamId, DuplexStream) {
        let (public, relay_side) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(relay_side);
        let id = session
            .open_stream(origin, reader, writer, Bytes::from_static(initial))
            .await
            .unwrap();
        (id, public)
    }

    #[tokio::test]
    async fn test_open_stream_announces_then_sends_initial_bytes() {
        let (session, mut rx) = create_session("foo");
        let (id, _public) = open(&session, StreamOrigin::Http, b"GET / HTTP/1.1\r\n\r\n").await;

        assert_eq!(id, 2);
        assert_eq!(next_frame(&mut rx).await, Frame::Registered { stream_id: 2 });
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::msg(2, &b"GET / HTTP/1.1\r\n\r\n"[..])
        );
        assert_eq!(session.stream_ids().await, vec![2]);
    }

    #[tokio::test]
    async fn test_tcp_stream_has_no_initial_msg() {
        let (session, mut rx) = create_session("foo");
        let (_id, mut public) = open(&session, StreamOrigin::Tcp, b"").await;

        assert_eq!(next_frame(&mut rx).await, Frame::Start { stream_id: 2 });

        public.write_all(b"ping").await.unwrap();
        assert_eq!(next_frame(&mut rx).await, Frame::msg(2, &b"ping"[..]));
    }

    #[tokio::test]
    async fn test_stream_ids_strictly_increase() {
        let (session, _rx) = create_session("foo");

        let mut ids = Vec::new();
        let mut publics = Vec::new();
        for _ in 0..5 {
            let (id, public) = open(&session, StreamOrigin::Tcp, b"").await;
            ids.push(id);
            publics.push(public);
        }
        assert_eq!(ids, vec![2, 3, 4, 5, 6]);

        // ids are not reused after removal
        session.remove_stream(6).await;
        let (id, _public) = open(&session, StreamOrigin::Tcp, b"").await;
        assert_eq!(id, 7);
    }

    #[tokio::test]
    async fn test_agent_payload_reaches_public_connection() {
        let (session, mut rx) = create_session("foo");
        let (_id, mut public) = open(&session, StreamOrigin::Http, b"").await;
        next_frame(&mut rx).await;

        session.handle_text("msg:2:48656c6c6f").await;
        session.handle_text("close:2").await;

        let mut received = Vec::new();
        tokio::time::timeout(WAIT, public.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"Hello");
        assert_eq!(session.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_stream_gets_exactly_one_close() {
        let (session, mut rx) = create_session("foo");
        let (_id, _public) = open(&session, StreamOrigin::Http, b"").await;
        next_frame(&mut rx).await;

        session.handle_text("msg:9:00ff").await;

        assert_eq!(next_frame(&mut rx).await, Frame::close(9));
        assert!(rx.try_recv().is_err());
        assert_eq!(session.stream_ids().await, vec![2]);
    }

    #[tokio::test]
    async fn test_bad_frames_leave_streams_untouched() {
        let (session, mut rx) = create_session("foo");
        let (_id, _public) = open(&session, StreamOrigin::Http, b"").await;
        next_frame(&mut rx).await;

        for text in ["msg:2", "msg", "msg:x:00", "msg:2:zz", "bogus:2", "close:abc"] {
            session.handle_text(text).await;
        }

        assert_eq!(session.stream_ids().await, vec![2]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_of_absent_stream_is_noop() {
        let (session, mut rx) = create_session("foo");
        session.handle_text("close:42").await;
        assert_eq!(session.stream_count().await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_public_eof_sends_close_and_removes_stream() {
        let (session, mut rx) = create_session("foo");
        let (_id, mut public) = open(&session, StreamOrigin::Tcp, b"").await;
        assert_eq!(next_frame(&mut rx).await, Frame::Start { stream_id: 2 });

        public.write_all(b"bye").await.unwrap();
        public.shutdown().await.unwrap();

        assert_eq!(next_frame(&mut rx).await, Frame::msg(2, &b"bye"[..]));
        assert_eq!(next_frame(&mut rx).await, Frame::close(2));
        assert_eq!(session.stream_count().await, 0);
    }

    #[tokio::test]
    async fn test_large_reads_are_chunked() {
        let (session, mut rx) = create_session("foo");
        let (public, relay_side) = tokio::io::duplex(RELAY_CHUNK_SIZE * 2);
        let (reader, writer) = tokio::io::split(relay_side);
        session
            .open_stream(StreamOrigin::Tcp, reader, writer, Bytes::new())
            .await
            .unwrap();
        next_frame(&mut rx).await;

        let payload: Vec<u8> = (0..RELAY_CHUNK_SIZE + 10).map(|i| i as u8).collect();
        let mut public = public;
        public.write_all(&payload).await.unwrap();
        public.shutdown().await.unwrap();

        let mut received = Vec::new();
        loop {
            match next_frame(&mut rx).await {
                Frame::Msg { payload, .. } => {
                    assert!(payload.len() <= RELAY_CHUNK_SIZE);
                    received.extend_from_slice(&payload);
                }
                Frame::Close { stream_id } => {
                    assert_eq!(stream_id, 2);
                    break;
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_shutdown_closes_streams_and_evicts() {
        let registry = SessionRegistry::new();
        let (session, _rx) = create_session("foo");
        registry.set("foo", session.clone());

        let (_a, mut public_a) = open(&session, StreamOrigin::Http, b"").await;
        let (_b, mut public_b) = open(&session, StreamOrigin::Tcp, b"").await;

        session.shutdown(&registry).await;
        session.shutdown(&registry).await;

        assert_eq!(session.stream_count().await, 0);
        assert!(registry.get("foo").is_none());

        let mut buf = Vec::new();
        tokio::time::timeout(WAIT, public_a.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        tokio::time::timeout(WAIT, public_b.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stale_shutdown_keeps_newer_session() {
        let registry = SessionRegistry::new();
        let (old, _old_rx) = create_session("foo");
        let (new, _new_rx) = create_session("foo");

        registry.set("foo", old.clone());
        registry.set("foo", new.clone());
        old.shutdown(&registry).await;

        assert!(Arc::ptr_eq(&registry.get("foo").unwrap(), &new));
    }

    #[tokio::test]
    async fn test_open_stream_after_shutdown_fails() {
        let registry = SessionRegistry::new();
        let (session, _rx) = create_session("foo");
        session.shutdown(&registry).await;

        let (_public, relay_side) = tokio::io::duplex(64);
        let (reader, writer) = tokio::io::split(relay_side);
        let result = session
            .open_stream(StreamOrigin::Http, reader, writer, Bytes::new())
            .await;
        assert!(matches!(result, Err(ControlError::ChannelClosed)));
        assert_eq!(session.stream_count().await, 0);
    }

    /// Public connection that times out once, then yields `data` and ends
    struct FlakyReader {
        timed_out: bool,
        data: Option<&'static [u8]>,
    }

    impl AsyncRead for FlakyReader {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if !self.timed_out {
                self.timed_out = true;
                return std::task::Poll::Ready(Err(io::Error::from(io::ErrorKind::TimedOut)));
            }
            if let Some(data) = self.data.take() {
                buf.put_slice(data);
            }
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_read_timeout_is_retried() {
        let (session, mut rx) = create_session("foo");
        let reader = FlakyReader {
            timed_out: false,
            data: Some(b"after timeout"),
        };
        session
            .open_stream(StreamOrigin::Tcp, reader, tokio::io::sink(), Bytes::new())
            .await
            .unwrap();

        assert_eq!(next_frame(&mut rx).await, Frame::Start { stream_id: 2 });
        assert_eq!(
            next_frame(&mut rx).await,
            Frame::msg(2, &b"after timeout"[..])
        );
        assert_eq!(next_frame(&mut rx).await, Frame::close(2));
    }
}
