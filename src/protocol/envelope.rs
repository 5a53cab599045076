//! Envelope and correlation types.
//!
//! An [`Envelope`] is the only entity on the wire: a MessagePack map
//! carrying either a call (`id` + `method_name` + arguments), a reply
//! (`id` + exactly one of `result`/`exception`), or the server's
//! one-time handshake (`id` absent, no method name).
//!
//! Optional fields are omitted from the map entirely when absent, so
//! "field not present" and "field present but null" stay distinct
//! across the wire. A method returning null is a `result` of
//! `Value::Null`, not a missing `result`.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ProxyError, Result};

/// Unique correlation identifier linking a call envelope to its reply.
///
/// Generated randomly (uuid v4) so concurrent callers never collide.
/// Opaque to the transport layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(String);

impl CallId {
    /// Generate a new unique call ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Borrow the call ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CallId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured, transport-safe error value carried in fault replies.
///
/// The original error object never crosses the process boundary; only
/// its kind and message (plus optional structured details) survive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Error kind, e.g. `"no_such_method"` or a domain error name.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RemoteError {
    /// Create a new remote error with the given kind and message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: None,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Kind used when the requested method is not registered.
    pub fn no_such_method(name: &str) -> Self {
        Self::new("no_such_method", format!("no such method: {name}"))
    }

    /// Kind used when a call envelope is structurally invalid.
    pub fn bad_envelope(message: impl Into<String>) -> Self {
        Self::new("bad_envelope", message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// One discrete protocol message: a call, a reply, or the handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Correlation id; `None` only on the one-time handshake.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<CallId>,

    /// Method to invoke; present only on call envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method_name: Option<String>,

    /// Positional call arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Value>,

    /// Named call arguments.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub kwargs: BTreeMap<String, Value>,

    /// Return value on a success reply. `Some(Value::Null)` is a
    /// legitimate null return, distinct from an absent field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Captured failure on a fault reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteError>,
}

impl Envelope {
    /// Build a call envelope.
    pub fn call(
        id: CallId,
        method_name: impl Into<String>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            id: Some(id),
            method_name: Some(method_name.into()),
            args,
            kwargs,
            result: None,
            exception: None,
        }
    }

    /// Build a success reply for the given call id.
    pub fn reply(id: CallId, result: Value) -> Self {
        Self {
            id: Some(id),
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            result: Some(result),
            exception: None,
        }
    }

    /// Build a fault reply for the given call id.
    pub fn fault(id: CallId, error: RemoteError) -> Self {
        Self {
            id: Some(id),
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            result: None,
            exception: Some(error),
        }
    }

    /// Build the server's one-time startup handshake.
    ///
    /// Carries a null `result` and no id; it is never replied to.
    pub fn handshake() -> Self {
        Self {
            id: None,
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            result: Some(Value::Null),
            exception: None,
        }
    }

    /// True for the startup handshake (no id, no method name).
    pub fn is_handshake(&self) -> bool {
        self.id.is_none() && self.method_name.is_none()
    }

    /// True for a call envelope (id plus method name).
    pub fn is_call(&self) -> bool {
        self.id.is_some() && self.method_name.is_some()
    }

    /// True for a reply envelope (id, no method name).
    pub fn is_reply(&self) -> bool {
        self.id.is_some() && self.method_name.is_none()
    }

    /// Consume a reply envelope and extract its outcome.
    ///
    /// Enforces the "exactly one of result/exception" invariant:
    /// a reply carrying neither or both is a protocol error.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Remote` if the reply carries an exception
    /// - `ProxyError::Protocol` if the invariant is violated
    pub fn into_outcome(self) -> Result<Value> {
        match (self.result, self.exception) {
            (Some(value), None) => Ok(value),
            (None, Some(error)) => Err(ProxyError::Remote(error)),
            (None, None) => Err(ProxyError::Protocol(
                "reply carries neither result nor exception".into(),
            )),
            (Some(_), Some(_)) => Err(ProxyError::Protocol(
                "reply carries both result and exception".into(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_id_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_call_id_format() {
        let id = CallId::generate();
        assert_eq!(id.to_string().len(), 36); // Standard UUID format
    }

    #[test]
    fn test_classification() {
        let id = CallId::generate();
        assert!(Envelope::handshake().is_handshake());
        assert!(Envelope::call(id.clone(), "echo", vec![], BTreeMap::new()).is_call());
        assert!(Envelope::reply(id.clone(), json!(1)).is_reply());
        assert!(Envelope::fault(id, RemoteError::new("e", "m")).is_reply());
    }

    #[test]
    fn test_handshake_is_not_a_reply() {
        let hs = Envelope::handshake();
        assert!(!hs.is_reply());
        assert!(!hs.is_call());
    }

    #[test]
    fn test_outcome_success() {
        let id = CallId::generate();
        let value = Envelope::reply(id, json!("hi")).into_outcome().unwrap();
        assert_eq!(value, json!("hi"));
    }

    #[test]
    fn test_outcome_null_result_is_success() {
        let id = CallId::generate();
        let value = Envelope::reply(id, Value::Null).into_outcome().unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_outcome_fault() {
        let id = CallId::generate();
        let err = Envelope::fault(id, RemoteError::new("DomainError", "nope"))
            .into_outcome()
            .unwrap_err();
        match err {
            ProxyError::Remote(remote) => {
                assert_eq!(remote.kind, "DomainError");
                assert_eq!(remote.message, "nope");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[test]
    fn test_outcome_neither_is_protocol_error() {
        let env = Envelope {
            id: Some(CallId::generate()),
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            result: None,
            exception: None,
        };
        assert!(matches!(env.into_outcome(), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_outcome_both_is_protocol_error() {
        let env = Envelope {
            id: Some(CallId::generate()),
            method_name: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            result: Some(json!(1)),
            exception: Some(RemoteError::new("e", "m")),
        };
        assert!(matches!(env.into_outcome(), Err(ProxyError::Protocol(_))));
    }

    #[test]
    fn test_absent_fields_survive_roundtrip() {
        // A reply with result = null must not collapse into "no result".
        let id = CallId::generate();
        let bytes = rmp_serde::to_vec_named(&Envelope::reply(id, Value::Null)).unwrap();
        let back: Envelope = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back.result, Some(Value::Null));
        assert!(back.exception.is_none());
    }
}
