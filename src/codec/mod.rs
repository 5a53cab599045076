//! Codec module - envelope serialization.
//!
//! Envelopes are encoded as MessagePack maps with a 4-byte big-endian
//! length prefix, making the stream self-delimiting without any outer
//! framing.
//!
//! Always `rmp_serde::to_vec_named`, never `to_vec`: the data model
//! calls for envelopes to be maps with named fields on the wire, and
//! `to_vec` would emit positional arrays instead.
//!
//! # Example
//!
//! ```
//! use pipeproxy::codec::EnvelopeCodec;
//! use pipeproxy::protocol::Envelope;
//!
//! let bytes = EnvelopeCodec::encode(&Envelope::handshake()).unwrap();
//! let body = &bytes[4..];
//! let decoded = EnvelopeCodec::decode_body(body).unwrap();
//! assert!(decoded.is_handshake());
//! ```

use crate::error::Result;
use crate::protocol::{Envelope, LEN_PREFIX_SIZE};

/// Length-prefixed MessagePack codec for envelopes.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Encode an envelope to length-prefixed bytes ready for the pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be serialized.
    pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec_named(envelope)?;

        let mut out = Vec::with_capacity(LEN_PREFIX_SIZE + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    /// Decode an envelope from a complete body (prefix already stripped).
    ///
    /// # Errors
    ///
    /// Returns a decode error if the bytes are not a valid envelope.
    #[inline]
    pub fn decode_body(body: &[u8]) -> Result<Envelope> {
        Ok(rmp_serde::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CallId, RemoteError};
    use serde_json::json;
    use std::collections::BTreeMap;

    #[test]
    fn test_prefix_matches_body_len() {
        let bytes = EnvelopeCodec::encode(&Envelope::handshake()).unwrap();
        let len = u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(len, bytes.len() - 4);
    }

    #[test]
    fn test_encode_decode_call() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("depth".to_string(), json!(3));
        let env = Envelope::call(
            CallId::generate(),
            "restart",
            vec![json!("now"), json!(true)],
            kwargs,
        );

        let bytes = EnvelopeCodec::encode(&env).unwrap();
        let decoded = EnvelopeCodec::decode_body(&bytes[4..]).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_encode_decode_fault() {
        let env = Envelope::fault(
            CallId::generate(),
            RemoteError::new("DomainError", "nope").with_details(json!({"code": 7})),
        );

        let bytes = EnvelopeCodec::encode(&env).unwrap();
        let decoded = EnvelopeCodec::decode_body(&bytes[4..]).unwrap();
        assert_eq!(decoded, env);
    }

    #[test]
    fn test_body_is_a_msgpack_map() {
        // Map format starts with 0x8X (fixmap); positional encoding
        // would start with 0x9X (fixarray).
        let bytes = EnvelopeCodec::encode(&Envelope::handshake()).unwrap();
        assert_eq!(
            bytes[4] & 0xF0,
            0x80,
            "expected map format (0x8X), got {:02X}",
            bytes[4]
        );
    }

    #[test]
    fn test_decode_error_on_invalid_body() {
        assert!(EnvelopeCodec::decode_body(b"not valid msgpack").is_err());
    }
}
