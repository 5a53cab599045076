//! Incremental envelope decoding from a byte stream.
//!
//! Pipes deliver bytes in arbitrary chunks, so the decoder accumulates
//! partial reads in a `bytes::BytesMut` buffer and runs a small state
//! machine:
//! - `WaitingForLength`: need the 4-byte length prefix
//! - `WaitingForBody`: prefix parsed, need N more body bytes
//!
//! A malformed body or an oversized length prefix is a
//! [`ProxyError::Protocol`] violation, not end-of-stream; callers must
//! treat the two differently.

use bytes::{Buf, BytesMut};

use super::envelope::Envelope;
use crate::codec::EnvelopeCodec;
use crate::error::{ProxyError, Result};

/// Size of the big-endian length prefix preceding each envelope body.
pub const LEN_PREFIX_SIZE: usize = 4;

/// Default maximum envelope body size (64 MB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// State machine for envelope extraction.
#[derive(Debug, Clone, Copy)]
enum State {
    /// Waiting for the complete length prefix.
    WaitingForLength,
    /// Prefix parsed, waiting for that many body bytes.
    WaitingForBody { body_len: u32 },
}

/// Buffer accumulating incoming bytes and extracting complete envelopes.
pub struct EnvelopeStream {
    /// Accumulated bytes from pipe reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed body size.
    max_body_size: u32,
}

impl EnvelopeStream {
    /// Create a new stream decoder with default limits.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }

    /// Create a stream decoder with a custom max body size.
    pub fn with_max_body(max_body_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForLength,
            max_body_size,
        }
    }

    /// Push data into the buffer and extract all complete envelopes.
    ///
    /// Returns every envelope completed by this chunk (possibly none);
    /// partial data is buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Protocol` if the announced body size exceeds
    /// the limit, or a decode error if a complete body is malformed.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Envelope>> {
        self.buffer.extend_from_slice(data);

        let mut envelopes = Vec::new();
        while let Some(envelope) = self.try_extract_one()? {
            envelopes.push(envelope);
        }
        Ok(envelopes)
    }

    /// Try to extract a single envelope from the buffer.
    fn try_extract_one(&mut self) -> Result<Option<Envelope>> {
        loop {
            match self.state {
                State::WaitingForLength => {
                    if self.buffer.len() < LEN_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let mut prefix = [0u8; LEN_PREFIX_SIZE];
                    prefix.copy_from_slice(&self.buffer[..LEN_PREFIX_SIZE]);
                    let body_len = u32::from_be_bytes(prefix);

                    if body_len > self.max_body_size {
                        return Err(ProxyError::Protocol(format!(
                            "envelope body of {} bytes exceeds limit of {}",
                            body_len, self.max_body_size
                        )));
                    }

                    self.buffer.advance(LEN_PREFIX_SIZE);
                    self.state = State::WaitingForBody { body_len };
                }
                State::WaitingForBody { body_len } => {
                    let body_len = body_len as usize;
                    if self.buffer.len() < body_len {
                        return Ok(None);
                    }

                    let body = self.buffer.split_to(body_len);
                    self.state = State::WaitingForLength;

                    let envelope = EnvelopeCodec::decode_body(&body)?;
                    return Ok(Some(envelope));
                }
            }
        }
    }

    /// Number of buffered bytes not yet consumed by a complete envelope.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for EnvelopeStream {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::envelope::CallId;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn encoded(envelope: &Envelope) -> Vec<u8> {
        EnvelopeCodec::encode(envelope).unwrap()
    }

    #[test]
    fn test_single_envelope() {
        let mut stream = EnvelopeStream::new();
        let env = Envelope::call(CallId::generate(), "echo", vec![json!("hi")], BTreeMap::new());

        let out = stream.push(&encoded(&env)).unwrap();
        assert_eq!(out, vec![env]);
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn test_fragmented_delivery() {
        let mut stream = EnvelopeStream::new();
        let env = Envelope::reply(CallId::generate(), json!({"a": 1}));
        let bytes = encoded(&env);

        // Byte-at-a-time: nothing until the final byte lands.
        for b in &bytes[..bytes.len() - 1] {
            assert!(stream.push(std::slice::from_ref(b)).unwrap().is_empty());
        }
        let out = stream.push(&bytes[bytes.len() - 1..]).unwrap();
        assert_eq!(out, vec![env]);
    }

    #[test]
    fn test_multiple_envelopes_one_chunk() {
        let mut stream = EnvelopeStream::new();
        let envs: Vec<Envelope> = (0..5)
            .map(|i| Envelope::reply(CallId::generate(), json!(i)))
            .collect();

        let mut bytes = Vec::new();
        for env in &envs {
            bytes.extend(encoded(env));
        }

        let out = stream.push(&bytes).unwrap();
        assert_eq!(out, envs);
    }

    #[test]
    fn test_split_across_prefix_boundary() {
        let mut stream = EnvelopeStream::new();
        let env = Envelope::handshake();
        let bytes = encoded(&env);

        // Two bytes of the prefix, then the rest.
        assert!(stream.push(&bytes[..2]).unwrap().is_empty());
        let out = stream.push(&bytes[2..]).unwrap();
        assert_eq!(out, vec![env]);
    }

    #[test]
    fn test_oversized_body_is_protocol_error() {
        let mut stream = EnvelopeStream::with_max_body(16);
        let prefix = 1024u32.to_be_bytes();
        let err = stream.push(&prefix).unwrap_err();
        assert!(matches!(err, ProxyError::Protocol(_)));
    }

    #[test]
    fn test_malformed_body_is_an_error_not_eof() {
        let mut stream = EnvelopeStream::new();
        let mut bytes = 4u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0xc1, 0xc1, 0xc1, 0xc1]); // 0xc1 is never valid msgpack
        assert!(stream.push(&bytes).is_err());
    }

    #[test]
    fn test_trailing_partial_is_buffered() {
        let mut stream = EnvelopeStream::new();
        let first = Envelope::reply(CallId::generate(), json!(1));
        let second = Envelope::reply(CallId::generate(), json!(2));

        let mut bytes = encoded(&first);
        let second_bytes = encoded(&second);
        bytes.extend(&second_bytes[..3]);

        let out = stream.push(&bytes).unwrap();
        assert_eq!(out, vec![first]);
        assert!(stream.buffered() > 0);

        let out = stream.push(&second_bytes[3..]).unwrap();
        assert_eq!(out, vec![second]);
    }
}
