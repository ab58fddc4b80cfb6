//! Translation between [`Envelope`] values and the transport unit (UTF-8
//! JSON bytes).
//!
//! Decode failures are classified so the receive loop can tell garbage from
//! a well-formed envelope of an unrecognized kind; both are recoverable
//! per-message and never terminate the loop.

use serde_json::Value;
use thiserror::Error;

use crate::messages::Envelope;

/// Encoding failed for a value violating the schema contract.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("envelope encode: {0}")]
    Serialize(#[source] serde_json::Error),
}

/// A single inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Not JSON, or JSON that does not satisfy the envelope shape.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// Well-formed envelope whose `kind` is not one of the known kinds.
    #[error("unrecognized message kind `{0}`")]
    UnknownKind(String),
}

const KNOWN_KINDS: [&str; 4] = ["request", "response", "error", "notification"];

/// Serializes an envelope into one transport unit.
pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    serde_json::to_vec(envelope).map_err(EncodeError::Serialize)
}

/// Parses one transport unit into an envelope.
///
/// The `kind` discriminator is inspected before full deserialization so an
/// unknown kind surfaces as [`DecodeError::UnknownKind`] rather than a
/// generic parse failure.
pub fn decode_envelope(unit: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(unit).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let kind = value
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing `kind` field".into()))?;
    if !KNOWN_KINDS.contains(&kind) {
        return Err(DecodeError::UnknownKind(kind.to_string()));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Envelope, ErrorDetail};
    use serde_json::json;

    #[test]
    fn round_trips_every_kind() {
        let envelopes = [
            Envelope::request(1, "session/hello", json!({"x": 1})),
            Envelope::Response {
                id: 1,
                result: json!({"ok": true}),
            },
            Envelope::Error {
                id: 2,
                error: ErrorDetail::new(404, "no such note"),
            },
            Envelope::notification("resource/changed", json!({"uri": "resource://notes"})),
        ];
        for envelope in envelopes {
            let unit = encode_envelope(&envelope).unwrap();
            assert_eq!(decode_envelope(&unit).unwrap(), envelope);
        }
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            decode_envelope(b"not json at all"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn missing_kind_is_malformed() {
        assert!(matches!(
            decode_envelope(br#"{"id": 1, "result": null}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn unknown_kind_is_classified_separately() {
        let err = decode_envelope(br#"{"kind": "broadcast", "method": "x"}"#).unwrap_err();
        match err {
            DecodeError::UnknownKind(kind) => assert_eq!(kind, "broadcast"),
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn known_kind_with_wrong_fields_is_malformed() {
        // A response without its correlation id cannot be dispatched.
        assert!(matches!(
            decode_envelope(br#"{"kind": "response", "result": 1}"#),
            Err(DecodeError::Malformed(_))
        ));
    }
}
