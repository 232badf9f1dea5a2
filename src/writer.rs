//! Dedicated writer task per connection.
//!
//! Every producer (publishers, handler tasks, the server's fan-out) hands
//! frames to a bounded mpsc channel drained by one task that owns the write
//! half of the stream. A single consumer gives strict send-order delivery,
//! and batching lets several frames leave in one `writev`.
//!
//! ```text
//! publish ──┐
//! reply   ──┼─► mpsc::Sender<OutboundFrame> (bounded) ─► Writer Task ─► stream
//! relay   ──┘
//! ```
//!
//! The queue is bounded: a peer that stops reading fills it, and producers
//! get [`BusError::BackpressureTimeout`] instead of growing memory without
//! limit. The connection layer treats that as fatal for the connection.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{BusError, Result};
use crate::protocol::{Header, HEADER_SIZE};

/// Default maximum queued frames per connection.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Default time a sender waits for queue space.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug, Clone)]
pub struct OutboundFrame {
    /// Pre-encoded length header.
    pub header: [u8; HEADER_SIZE],
    /// Envelope body.
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Frame the given body.
    ///
    /// Fails if the body does not fit the 32-bit length prefix.
    #[inline]
    pub fn new(payload: Bytes) -> Result<Self> {
        Ok(Self {
            header: Header::for_body(payload.len())?.encode(),
            payload,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Queue capacity. Senders block (or fail, for `try_send`) beyond this.
    pub max_pending_frames: usize,
    /// How long `send` waits for queue space.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task. Cheap to clone.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    /// Frames queued or in flight but not yet written.
    pending: Arc<AtomicUsize>,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting up to the backpressure timeout for space.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        let permit = match tokio::time::timeout(self.timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(BusError::ConnectionLost),
            Err(_) => return Err(BusError::BackpressureTimeout),
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        permit.send(frame);
        Ok(())
    }

    /// Queue a frame without waiting.
    ///
    /// Returns `Err(BackpressureTimeout)` immediately if the queue is full.
    pub fn try_send(&self, frame: OutboundFrame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(_) => BusError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => BusError::ConnectionLost,
            }
        })
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends cleanly once every [`WriterHandle`] is dropped, or with an
/// error on the first failed write.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.max_pending_frames.max(1));
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        timeout: config.backpressure_timeout,
    };
    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        write_batch(&mut writer, &batch).await?;
        pending.fetch_sub(batch.len(), Ordering::Release);
        batch.clear();
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write a batch of frames using scatter/gather I/O.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(BusError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// IoSlices covering everything after the first `skip_bytes` of the batch.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        for part in [&frame.header[..], &frame.payload[..]] {
            let end = offset + part.len();
            if !part.is_empty() && skip_bytes < end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&part[start..]));
            }
            offset = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::{duplex, AsyncReadExt};

    fn frame(body: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(Bytes::from_static(body)).unwrap()
    }

    #[test]
    fn test_outbound_frame_header_matches_body() {
        let f = frame(b"hello");
        assert_eq!(f.header, [5, 0, 0, 0]);
        assert_eq!(f.size(), HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_send_writes_framed_bytes() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        handle.send(frame(b"hello")).await.unwrap();

        let mut buf = [0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\x05\x00\x00\x00hello");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_send_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 0..200u32 {
            handle
                .send(OutboundFrame::new(Bytes::copy_from_slice(&i.to_le_bytes())).unwrap())
                .await
                .unwrap();
        }

        let mut buf = vec![0u8; 200 * (HEADER_SIZE + 4)];
        server.read_exact(&mut buf).await.unwrap();
        for (i, chunk) in buf.chunks(HEADER_SIZE + 4).enumerate() {
            assert_eq!(&chunk[..HEADER_SIZE], &[4, 0, 0, 0]);
            assert_eq!(u32::from_le_bytes(chunk[HEADER_SIZE..].try_into().unwrap()), i as u32);
        }
    }

    #[tokio::test]
    async fn test_try_send_fails_when_full() {
        // A tiny duplex that nobody reads fills up quickly.
        let (client, _server) = duplex(8);
        let config = WriterConfig {
            max_pending_frames: 2,
            backpressure_timeout: Duration::from_millis(20),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        let mut saw_full = false;
        for _ in 0..16 {
            if let Err(e) = handle.try_send(frame(b"0123456789")) {
                assert!(matches!(e, BusError::BackpressureTimeout));
                saw_full = true;
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_send_times_out_under_backpressure() {
        let (client, _server) = duplex(8);
        let config = WriterConfig {
            max_pending_frames: 1,
            backpressure_timeout: Duration::from_millis(20),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        let mut result = Ok(());
        for _ in 0..8 {
            result = handle.send(frame(b"0123456789")).await;
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(BusError::BackpressureTimeout)));
    }

    #[test]
    fn test_build_remaining_slices_partial_header() {
        let batch = vec![frame(b"hello")];

        let slices = build_remaining_slices(&batch, 1);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 1);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_build_remaining_slices_mid_second_frame() {
        let batch = vec![frame(b"abc"), frame(b"defg")];

        let slices = build_remaining_slices(&batch, HEADER_SIZE + 3 + HEADER_SIZE + 1);
        assert_eq!(slices.len(), 1);
        assert_eq!(&*slices[0], b"efg");
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch: Vec<_> = (0..5).map(|_| frame(b"abc")).collect();

        write_batch(&mut buf, &batch).await.unwrap();

        assert_eq!(buf.into_inner().len(), 5 * (HEADER_SIZE + 3));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
