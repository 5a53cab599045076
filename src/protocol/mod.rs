//! Protocol module - envelopes, correlation ids, and stream decoding.
//!
//! The wire protocol is a sequence of self-delimiting envelopes in each
//! direction: a 4-byte big-endian length prefix followed by a
//! MessagePack map. There is no version field and no framing beyond
//! the prefix.

mod envelope;
mod stream;

pub use envelope::{CallId, Envelope, RemoteError};
pub use stream::{EnvelopeStream, DEFAULT_MAX_BODY_SIZE, LEN_PREFIX_SIZE};
