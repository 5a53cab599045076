//! Dedicated writer task serializing outbound envelopes.
//!
//! Both sides of the proxy may have many concurrent producers (spawned
//! invocation tasks on the server, concurrent callers on the client)
//! sharing one outbound pipe. Instead of a mutex around encode+flush,
//! a single writer task owns the write half and receives pre-encoded
//! envelopes via an mpsc channel, so envelope bytes are never
//! interleaved.
//!
//! ```text
//! Caller 1 ─┐
//! Caller 2 ─┼─► mpsc::Sender<OutboundEnvelope> ─► Writer Task ─► Pipe
//! Caller N ─┘
//! ```
//!
//! A pending counter bounds the queue: past the limit, senders wait for
//! the backlog to clear, timing out with `BackpressureTimeout`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::EnvelopeCodec;
use crate::error::{ProxyError, Result};
use crate::protocol::Envelope;

/// Default maximum queued envelopes before backpressure kicks in.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum envelopes written between flushes.
const MAX_BATCH_SIZE: usize = 64;

/// A pre-encoded envelope ready to be written to the pipe.
#[derive(Debug)]
pub struct OutboundEnvelope {
    /// Length-prefixed encoded bytes.
    bytes: Bytes,
}

impl OutboundEnvelope {
    /// Encode an envelope for sending.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn encode(envelope: &Envelope) -> Result<Self> {
        Ok(Self {
            bytes: Bytes::from(EnvelopeCodec::encode(envelope)?),
        })
    }

    /// Total size on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum queued envelopes before backpressure kicks in.
    pub max_pending: usize,
    /// Channel capacity for the envelope queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending: DEFAULT_MAX_PENDING,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending envelopes to the writer task.
///
/// Cheaply cloneable; shared by every producer on one side.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundEnvelope>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(
        tx: mpsc::Sender<OutboundEnvelope>,
        pending: Arc<AtomicUsize>,
        max_pending: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            tx,
            pending,
            max_pending,
            timeout,
        }
    }

    /// Encode and send an envelope through the writer task.
    ///
    /// Waits if backpressure is active, timing out after the configured
    /// duration.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Encode` if serialization fails
    /// - `ProxyError::BackpressureTimeout` if the queue stays full
    /// - `ProxyError::ConnectionClosed` if the writer task is gone
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let outbound = OutboundEnvelope::encode(envelope)?;
        self.reserve_slot().await?;

        self.tx.send(outbound).await.map_err(|_| {
            // Saturating: the writer may have zeroed the counter while
            // this reservation was in flight.
            let _ = self
                .pending
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            ProxyError::ConnectionClosed
        })
    }

    /// Claim a queue slot, waiting out backpressure with timeout.
    ///
    /// Compare-and-swap so concurrent senders cannot pass the gate
    /// together and push the count over the cap.
    async fn reserve_slot(&self) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            let current = self.pending.load(Ordering::Acquire);
            if current < self.max_pending {
                if self
                    .pending
                    .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }
            if start.elapsed() > self.timeout {
                return Err(ProxyError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending.load(Ordering::Acquire) >= self.max_pending
    }

    /// Current queued envelope count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

/// Spawn the writer task and return a handle for sending envelopes.
///
/// The task exits cleanly once every handle clone is dropped and the
/// queue drains.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle::new(
        tx,
        pending.clone(),
        config.max_pending,
        config.backpressure_timeout,
    );

    let task = tokio::spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - pumps the queue until shutdown or a write error.
async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundEnvelope>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = pump_queue(&mut rx, &mut writer, &pending).await;
    if result.is_err() {
        // Envelopes still queued will never be written; a stale count
        // would leave later senders waiting out the backpressure
        // timeout instead of failing fast on the closed channel.
        pending.store(0, Ordering::Release);
    }
    result
}

/// Drains the queue and writes envelopes to the pipe.
///
/// Envelopes already queued behind the first one are written in the
/// same batch with a single flush at the end.
async fn pump_queue<W>(
    rx: &mut mpsc::Receiver<OutboundEnvelope>,
    writer: &mut W,
    pending: &AtomicUsize,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(envelope) => envelope,
            None => return Ok(()), // All handles dropped, clean shutdown.
        };

        let mut batch = 1usize;
        writer.write_all(&first.bytes).await?;

        while batch < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(envelope) => {
                    writer.write_all(&envelope.bytes).await?;
                    batch += 1;
                }
                Err(_) => break,
            }
        }

        writer.flush().await?;
        pending.fetch_sub(batch, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallId, EnvelopeStream};
    use serde_json::json;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_writer_config_default() {
        let config = WriterConfig::default();
        assert_eq!(config.max_pending, DEFAULT_MAX_PENDING);
        assert_eq!(config.channel_capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.backpressure_timeout, DEFAULT_BACKPRESSURE_TIMEOUT);
    }

    #[tokio::test]
    async fn test_send_reaches_the_pipe() {
        let (ours, mut theirs) = duplex(4096);
        let (handle, _task) = spawn_writer_task(ours, WriterConfig::default());

        let envelope = Envelope::reply(CallId::generate(), json!("hi"));
        handle.send(&envelope).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = theirs.read(&mut buf).await.unwrap();

        let mut stream = EnvelopeStream::new();
        let out = stream.push(&buf[..n]).unwrap();
        assert_eq!(out, vec![envelope]);
    }

    #[tokio::test]
    async fn test_concurrent_senders_never_interleave() {
        let (ours, mut theirs) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(ours, WriterConfig::default());

        let mut tasks = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let envelope = Envelope::reply(CallId::generate(), json!(i));
                handle.send(&envelope).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        drop(handle);

        let mut bytes = Vec::new();
        theirs.read_to_end(&mut bytes).await.unwrap();

        // Every envelope decodes cleanly, so no writes interleaved.
        let mut stream = EnvelopeStream::new();
        let out = stream.push(&bytes).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(stream.buffered(), 0);
    }

    #[tokio::test]
    async fn test_pending_count_starts_empty() {
        let (ours, _theirs) = duplex(4096);
        let (handle, _task) = spawn_writer_task(ours, WriterConfig::default());

        assert_eq!(handle.pending_count(), 0);
        assert!(!handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_write_error_resets_pending_and_closes() {
        let (ours, theirs) = duplex(4096);
        drop(theirs); // Writes now fail with a broken pipe.

        let config = WriterConfig {
            max_pending: 2,
            channel_capacity: 2,
            backpressure_timeout: Duration::from_millis(200),
        };
        let (handle, task) = spawn_writer_task(ours, config);

        let envelope = Envelope::reply(CallId::generate(), json!(0));
        // Queues fine; the loop hits the broken pipe when writing it.
        let _ = handle.send(&envelope).await;
        assert!(task.await.unwrap().is_err());

        // The stale count must not turn the failure into a
        // backpressure timeout for later senders.
        assert_eq!(handle.pending_count(), 0);
        let err = handle.send(&envelope).await.unwrap_err();
        assert!(matches!(err, ProxyError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (ours, _theirs) = duplex(4096);
        let (handle, task) = spawn_writer_task(ours, WriterConfig::default());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
