//! One duplex stream, framed.
//!
//! A [`Connection`] owns a read task and a writer task. The read task pulls
//! frames off the stream, decodes them and hands each envelope to an
//! [`InboundHandler`] that must not block: routing either queues the work
//! for a subscriber or spawns a handler task, then the loop reads on.
//!
//! Outbound frames from synchronous callers (publish fan-out, relays,
//! error replies) never wait: a burst that outruns the writer spills into
//! an ordered overflow queue. A connection is only given up on when its
//! writer queue stays full for the whole backpressure timeout.
//!
//! Any read error, write error or malformed frame terminates the
//! connection. The owner hears about it exactly once through
//! [`InboundHandler::on_closed`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{EnvelopeCodec, SealedEnvelope};
use crate::error::{BusError, Result};
use crate::protocol::FrameBuffer;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

/// Identity of a connection, unique per process.
pub type ConnectionId = Uuid;

/// Size of the read buffer handed to the stream.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reading and writing.
    Connected,
    /// Shutdown requested, tasks winding down.
    Closing,
    /// Gone; never reused.
    Closed,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connected,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// Receives everything a connection reads.
pub trait InboundHandler: Send + Sync + 'static {
    /// A decoded envelope, in arrival order. Must return promptly.
    fn on_envelope(&self, connection: &Arc<Connection>, envelope: SealedEnvelope);

    /// The connection reached [`ConnectionState::Closed`].
    fn on_closed(&self, connection: &Arc<Connection>);
}

/// Frames that found the writer queue full, in send order.
#[derive(Default)]
struct Overflow {
    frames: VecDeque<OutboundFrame>,
    /// A drain task owns the queue; new frames must line up behind it.
    draining: bool,
}

/// A live framed stream.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    writer: WriterHandle,
    overflow: Mutex<Overflow>,
    state: AtomicU8,
    shutdown: CancellationToken,
}

impl Connection {
    /// Start the read and write tasks for `stream`.
    ///
    /// The connection shuts down when `parent` is cancelled.
    pub fn spawn<S>(
        stream: S,
        peer: impl Into<String>,
        codec: Arc<EnvelopeCodec>,
        writer_config: WriterConfig,
        inbound: Arc<dyn InboundHandler>,
        parent: &CancellationToken,
    ) -> Arc<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, writer_config);

        let connection = Arc::new(Connection {
            id: Uuid::new_v4(),
            peer: peer.into(),
            writer,
            overflow: Mutex::new(Overflow::default()),
            state: AtomicU8::new(ConnectionState::Connected as u8),
            shutdown: parent.child_token(),
        });
        tracing::info!(connection = %connection.id, peer = %connection.peer, "connection established");

        tokio::spawn(connection.clone().run(reader, writer_task, codec, inbound));
        connection
    }

    async fn run<R>(
        self: Arc<Self>,
        reader: R,
        mut writer_task: JoinHandle<Result<()>>,
        codec: Arc<EnvelopeCodec>,
        inbound: Arc<dyn InboundHandler>,
    ) where
        R: AsyncRead + Unpin,
    {
        let outcome = tokio::select! {
            r = self.read_loop(reader, &codec, inbound.as_ref()) => r,
            r = &mut writer_task => match r {
                Ok(result) => result,
                Err(e) => Err(BusError::Protocol(format!("writer task failed: {}", e))),
            },
            _ = self.shutdown.cancelled() => Ok(()),
        };

        self.state
            .store(ConnectionState::Closing as u8, Ordering::Release);
        self.shutdown.cancel();
        writer_task.abort();

        match &outcome {
            Ok(()) => tracing::info!(connection = %self.id, peer = %self.peer, "connection closed"),
            Err(BusError::MalformedEnvelope(reason)) => {
                tracing::warn!(connection = %self.id, peer = %self.peer, %reason, "malformed frame, dropping connection")
            }
            Err(e) => tracing::warn!(connection = %self.id, peer = %self.peer, error = %e, "connection terminated"),
        }

        self.state.store(ConnectionState::Closed as u8, Ordering::Release);
        inbound.on_closed(&self);
    }

    async fn read_loop<R>(
        self: &Arc<Self>,
        mut reader: R,
        codec: &EnvelopeCodec,
        inbound: &dyn InboundHandler,
    ) -> Result<()>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameBuffer::with_max_frame_size(codec.max_frame_size());
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                if frames.is_mid_frame() {
                    return Err(BusError::MalformedEnvelope(
                        "stream ended mid-frame".to_string(),
                    ));
                }
                return Ok(());
            }

            let batch = frames
                .push(&buf[..n])
                .map_err(|e| BusError::MalformedEnvelope(e.to_string()))?;
            for frame in batch {
                let envelope = codec.open(frame.payload)?;
                inbound.on_envelope(self, envelope);
            }
        }
    }

    /// Connection id.
    #[inline]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Human-readable peer description (address or pipe name).
    #[inline]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether frames can still be sent.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Queue a frame, waiting for queue space up to the backpressure timeout.
    ///
    /// A backpressure timeout closes the connection.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(BusError::ConnectionLost);
        }
        {
            let mut overflow = self.overflow.lock();
            if overflow.draining {
                overflow.frames.push_back(frame);
                return Ok(());
            }
        }
        let result = self.writer.send(frame).await;
        self.check_send(result)
    }

    /// Queue a frame without waiting.
    ///
    /// When the writer queue is momentarily full the frame goes to an
    /// overflow queue that a background task feeds to the writer in order.
    /// Only a queue that stays full for the backpressure timeout closes the
    /// connection.
    pub fn enqueue(self: &Arc<Self>, frame: OutboundFrame) -> Result<()> {
        if !self.is_open() {
            return Err(BusError::ConnectionLost);
        }

        let mut overflow = self.overflow.lock();
        if !overflow.draining {
            match self.writer.try_send(frame.clone()) {
                Ok(()) => return Ok(()),
                Err(BusError::BackpressureTimeout) => {}
                Err(e) => return Err(e),
            }
            tracing::debug!(
                connection = %self.id,
                pending = self.writer.pending_count(),
                "outbound queue full, spilling to overflow"
            );
            overflow.draining = true;
            tokio::spawn(self.clone().drain_overflow());
        }
        overflow.frames.push_back(frame);
        Ok(())
    }

    async fn drain_overflow(self: Arc<Self>) {
        loop {
            let frame = {
                let mut overflow = self.overflow.lock();
                match overflow.frames.pop_front() {
                    Some(frame) => frame,
                    None => {
                        overflow.draining = false;
                        return;
                    }
                }
            };

            let sent = tokio::select! {
                _ = self.shutdown.cancelled() => Err(BusError::ConnectionLost),
                result = self.writer.send(frame) => self.check_send(result),
            };
            if let Err(e) = sent {
                let dropped = {
                    let mut overflow = self.overflow.lock();
                    let dropped = overflow.frames.len() + 1;
                    overflow.frames.clear();
                    dropped
                };
                tracing::debug!(connection = %self.id, error = %e, dropped, "overflow abandoned");
                self.close();
                return;
            }
        }
    }

    fn check_send(&self, result: Result<()>) -> Result<()> {
        if let Err(BusError::BackpressureTimeout) = result {
            tracing::warn!(
                connection = %self.id,
                peer = %self.peer,
                pending = self.writer.pending_count(),
                "peer is not draining its queue, closing connection"
            );
            self.close();
        }
        result
    }

    /// Request shutdown. Idempotent.
    pub fn close(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connected as u8,
            ConnectionState::Closing as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Envelope, PayloadFormat, PayloadKind};
    use crate::protocol::build_frame;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};
    use tokio::sync::mpsc;

    enum Event {
        Envelope(SealedEnvelope),
        Closed(ConnectionId),
    }

    struct Recorder(mpsc::UnboundedSender<Event>);

    impl InboundHandler for Recorder {
        fn on_envelope(&self, _connection: &Arc<Connection>, envelope: SealedEnvelope) {
            let _ = self.0.send(Event::Envelope(envelope));
        }

        fn on_closed(&self, connection: &Arc<Connection>) {
            let _ = self.0.send(Event::Closed(connection.id()));
        }
    }

    fn codec() -> Arc<EnvelopeCodec> {
        Arc::new(EnvelopeCodec::new(PayloadFormat::MsgPack))
    }

    fn spawn_pair(config: WriterConfig) -> (
        Arc<Connection>,
        Arc<Connection>,
        mpsc::UnboundedReceiver<Event>,
        CancellationToken,
    ) {
        let (a, b) = duplex(64 * 1024);
        let (tx, rx) = mpsc::unbounded_channel();
        let (drain_tx, _drain_rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();

        let left = Connection::spawn(
            a,
            "left",
            codec(),
            config.clone(),
            Arc::new(Recorder(drain_tx)),
            &lifetime,
        );
        let right = Connection::spawn(
            b,
            "right",
            codec(),
            config,
            Arc::new(Recorder(tx)),
            &lifetime,
        );
        (left, right, rx, lifetime)
    }

    #[tokio::test]
    async fn test_envelopes_arrive_in_send_order() {
        let (left, _right, mut rx, _lifetime) = spawn_pair(WriterConfig::default());
        let codec = codec();

        for i in 0..100u32 {
            let sealed = codec.encode(PayloadKind::Broadcast, "n", &i).unwrap();
            left.send(sealed.to_frame()).await.unwrap();
        }

        for i in 0..100u32 {
            match rx.recv().await.unwrap() {
                Event::Envelope(env) => {
                    let n: u32 = codec.decode_data(env.envelope()).unwrap();
                    assert_eq!(n, i);
                }
                Event::Closed(_) => panic!("closed early"),
            }
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (mut raw, b) = duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let conn = Connection::spawn(
            b,
            "peer",
            codec(),
            WriterConfig::default(),
            Arc::new(Recorder(tx)),
            &lifetime,
        );

        raw.write_all(&build_frame(b"definitely not msgpack")).await.unwrap();

        match rx.recv().await.unwrap() {
            Event::Closed(id) => assert_eq!(id, conn.id()),
            Event::Envelope(_) => panic!("garbage decoded"),
        }
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(
            conn.enqueue(OutboundFrame::new(Bytes::new()).unwrap()),
            Err(BusError::ConnectionLost)
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_notifies_owner_once() {
        let (left, right, mut rx, _lifetime) = spawn_pair(WriterConfig::default());

        left.close();

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(Event::Closed(id)) => assert_eq!(id, right.id()),
            _ => panic!("expected close notification"),
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_parent_cancellation_closes() {
        let (_left, right, mut rx, lifetime) = spawn_pair(WriterConfig::default());

        lifetime.cancel();

        assert!(matches!(rx.recv().await, Some(Event::Closed(_))));
        assert_eq!(right.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversize_frame_is_fatal() {
        let (mut raw, b) = duplex(4096);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let small = Arc::new(EnvelopeCodec::new(PayloadFormat::MsgPack).with_max_frame_size(16));
        let _conn = Connection::spawn(
            b,
            "peer",
            small,
            WriterConfig::default(),
            Arc::new(Recorder(tx)),
            &lifetime,
        );

        let env = Envelope::broadcast("x", Bytes::from(vec![0u8; 64]));
        let body = rmp_serde::to_vec_named(&env).unwrap();
        raw.write_all(&build_frame(&body)).await.unwrap();

        assert!(matches!(rx.recv().await, Some(Event::Closed(_))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_burst_beyond_queue_capacity_is_delivered_in_order() {
        let config = WriterConfig {
            max_pending_frames: 16,
            backpressure_timeout: Duration::from_secs(5),
        };
        let (left, _right, mut rx, _lifetime) = spawn_pair(config);
        let codec = codec();

        // No await between frames: the writer task cannot run until the loop ends.
        for i in 0..2000u32 {
            let sealed = codec.encode(PayloadKind::Broadcast, "n", &i).unwrap();
            left.enqueue(sealed.to_frame()).unwrap();
        }
        assert!(left.is_open());

        for i in 0..2000u32 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
                Some(Event::Envelope(env)) => {
                    let n: u32 = codec.decode_data(env.envelope()).unwrap();
                    assert_eq!(n, i);
                }
                _ => panic!("stream ended at {}", i),
            }
        }
        assert!(left.is_open());
    }

    #[tokio::test]
    async fn test_send_after_overflow_keeps_order() {
        let config = WriterConfig {
            max_pending_frames: 4,
            backpressure_timeout: Duration::from_secs(5),
        };
        let (left, _right, mut rx, _lifetime) = spawn_pair(config);
        let codec = codec();

        for i in 0..50u32 {
            let sealed = codec.encode(PayloadKind::Broadcast, "n", &i).unwrap();
            left.enqueue(sealed.to_frame()).unwrap();
        }
        let last = codec.encode(PayloadKind::Broadcast, "n", &50u32).unwrap();
        left.send(last.to_frame()).await.unwrap();

        for i in 0..=50u32 {
            match rx.recv().await.unwrap() {
                Event::Envelope(env) => {
                    assert_eq!(codec.decode_data::<u32>(env.envelope()).unwrap(), i);
                }
                Event::Closed(_) => panic!("closed early"),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_that_never_reads_is_dropped_after_timeout() {
        let (_stalled, b) = duplex(64);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();
        let config = WriterConfig {
            max_pending_frames: 2,
            backpressure_timeout: Duration::from_millis(50),
        };
        let conn = Connection::spawn(b, "stalled", codec(), config, Arc::new(Recorder(tx)), &lifetime);

        let codec = codec();
        for i in 0..100u32 {
            let sealed = codec.encode(PayloadKind::Broadcast, "n", &i).unwrap();
            if conn.enqueue(sealed.to_frame()).is_err() {
                break;
            }
        }

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap() {
            Some(Event::Closed(id)) => assert_eq!(id, conn.id()),
            _ => panic!("expected the stalled connection to close"),
        }
        assert!(!conn.is_open());
    }
}
