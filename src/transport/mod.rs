//! Transport module - pipe wiring and the inbound envelope reader.
//!
//! One direction of the duplex connection is a plain byte pipe. The
//! write side is owned by the writer task (see [`crate::writer`]); the
//! read side is wrapped by [`EnvelopeReader`], which both the server
//! dispatcher and the client correlator loop over.

#[cfg(unix)]
mod pipe;

#[cfg(unix)]
pub use pipe::{child_endpoints, CHILD_CALL_FD, CHILD_REPLY_FD};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;
use crate::protocol::{Envelope, EnvelopeStream};

/// Read buffer size for pipe reads.
const READ_BUF_SIZE: usize = 16 * 1024;

/// Pull-based reader decoding envelopes off one inbound stream.
///
/// Single consumer per direction, so no locking is needed here.
pub struct EnvelopeReader<R> {
    reader: R,
    stream: EnvelopeStream,
    /// Envelopes decoded but not yet handed out (a single read can
    /// complete more than one).
    ready: std::collections::VecDeque<Envelope>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> EnvelopeReader<R> {
    /// Wrap an inbound stream.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            stream: EnvelopeStream::new(),
            ready: std::collections::VecDeque::new(),
            buf: vec![0u8; READ_BUF_SIZE],
        }
    }

    /// Receive the next envelope.
    ///
    /// Returns `Ok(None)` on clean end-of-stream (the other side closed
    /// its write end). Malformed data is a `ProxyError::Protocol`
    /// violation, never conflated with closure.
    pub async fn next(&mut self) -> Result<Option<Envelope>> {
        loop {
            if let Some(envelope) = self.ready.pop_front() {
                return Ok(Some(envelope));
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }

            self.ready.extend(self.stream.push(&self.buf[..n])?);
        }
    }
}
