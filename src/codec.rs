//! Value codec
//!
//! Steps return heterogeneous typed values; the store only preserves
//! strings. `encode`/`decode` round-trip a value through a textual
//! payload plus a type tag so a replayed step observes the same typed
//! value it produced on first execution.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Reserved type tag for a null/absent step output.
pub const VOID_TAG: &str = "void";

/// Errors from encoding or decoding a step's output.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload failed to serialize.
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),

    /// The payload did not parse as the shape named by its type tag.
    #[error("failed to decode value tagged `{type_tag}`: {source}")]
    Decode {
        type_tag: String,
        #[source]
        source: serde_json::Error,
    },

    /// The caller asked to decode a tag that doesn't match what it expects.
    #[error("type tag mismatch: stored as `{stored}`, expected `{expected}`")]
    TagMismatch { stored: String, expected: String },
}

/// A step's output, serialized for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedOutput {
    /// Self-describing textual payload, absent for a null/void result.
    pub payload: Option<String>,
    /// Stable tag identifying the concrete shape of `payload`.
    pub type_tag: String,
}

impl EncodedOutput {
    /// The canonical encoding of a null/void result.
    pub fn void() -> Self {
        Self {
            payload: None,
            type_tag: VOID_TAG.to_string(),
        }
    }
}

/// Normalize `std::any::type_name::<T>()` into a stable tag string.
///
/// The raw type name is already stable within a single build of this
/// crate; we only strip generic module-path noise that tends to differ
/// across compiler versions for closures and anonymous types.
fn type_tag<T>() -> String {
    std::any::type_name::<T>().to_string()
}

/// Serialize `value` into a `(payload, type_tag)` pair.
///
/// `T = ()` (or any type serializing to `null`) is canonicalized to
/// [`EncodedOutput::void`] regardless of its type name, so callers that
/// return `()` observe the same VOID_TAG a future caller of `decode`
/// would see for an absent value.
pub fn encode<T: Serialize>(value: &T) -> Result<EncodedOutput, CodecError> {
    let json = serde_json::to_value(value).map_err(CodecError::Encode)?;
    if json.is_null() {
        return Ok(EncodedOutput::void());
    }

    let payload = serde_json::to_string(&json).map_err(CodecError::Encode)?;
    Ok(EncodedOutput {
        payload: Some(payload),
        type_tag: type_tag::<T>(),
    })
}

/// Reconstruct a typed value from a previously encoded `(payload, type_tag)` pair.
///
/// A `type_tag` of [`VOID_TAG`] or an absent `payload` always decodes to
/// `T`'s null representation (`serde_json::from_value(Value::Null)`),
/// regardless of what `T` is, mirroring how `encode` canonicalizes void
/// results independent of the static type that produced them.
pub fn decode<T: DeserializeOwned>(
    payload: Option<&str>,
    type_tag: &str,
) -> Result<T, CodecError> {
    if type_tag == VOID_TAG || payload.is_none() {
        return serde_json::from_value(serde_json::Value::Null).map_err(|source| {
            CodecError::Decode {
                type_tag: type_tag.to_string(),
                source,
            }
        });
    }

    let expected = type_tag::<T>();
    if type_tag != expected {
        return Err(CodecError::TagMismatch {
            stored: type_tag.to_string(),
            expected,
        });
    }

    let payload = payload.expect("checked above");
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|source| CodecError::Decode {
            type_tag: type_tag.to_string(),
            source,
        })?;

    serde_json::from_value(value).map_err(|source| CodecError::Decode {
        type_tag: type_tag.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Notification {
        id: u32,
        message: String,
    }

    #[test]
    fn round_trips_scalars() {
        let encoded = encode(&42i64).unwrap();
        assert_eq!(decode::<i64>(encoded.payload.as_deref(), &encoded.type_tag).unwrap(), 42);

        let encoded = encode(&"x".to_string()).unwrap();
        assert_eq!(
            decode::<String>(encoded.payload.as_deref(), &encoded.type_tag).unwrap(),
            "x"
        );
    }

    #[test]
    fn round_trips_structs() {
        let value = Notification {
            id: 7,
            message: "hi".to_string(),
        };
        let encoded = encode(&value).unwrap();
        let decoded: Notification =
            decode(encoded.payload.as_deref(), &encoded.type_tag).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn unit_encodes_as_void() {
        let encoded = encode(&()).unwrap();
        assert_eq!(encoded.type_tag, VOID_TAG);
        assert!(encoded.payload.is_none());
    }

    #[test]
    fn void_tag_decodes_regardless_of_payload() {
        let value: Option<Notification> = decode(None, VOID_TAG).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn malformed_payload_is_a_codec_error() {
        let tag = encode(&Notification {
            id: 1,
            message: "x".to_string(),
        })
        .unwrap()
        .type_tag;
        let err = decode::<Notification>(Some("\"not an object\""), &tag).unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn mismatched_tag_is_a_codec_error() {
        let err = decode::<Notification>(Some("{}"), "some::other::Type").unwrap_err();
        assert!(matches!(err, CodecError::TagMismatch { .. }));
    }
}
