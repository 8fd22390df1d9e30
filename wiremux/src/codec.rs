//! Pluggable envelope serialization.
//!
//! The [`MessageCodec`] trait lets users bring their own serialization
//! format while the crate ships a default [`JsonCodec`] that is convenient
//! to debug. Envelopes cross the wire as codec-encoded frame payloads; the
//! frame layer itself is format-agnostic.

use std::fmt;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Error type for codec operations.
#[derive(Debug)]
pub enum CodecError {
    /// Failed to encode a message to bytes.
    Encode(Box<dyn std::error::Error + Send + Sync>),
    /// Failed to decode bytes to a message.
    Decode(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Encode(e) => write!(f, "encode error: {}", e),
            CodecError::Decode(e) => write!(f, "decode error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Encode(e) => Some(e.as_ref()),
            CodecError::Decode(e) => Some(e.as_ref()),
        }
    }
}

/// Pluggable message serialization format.
///
/// `Clone + 'static` so codec instances can be stored in connections and
/// registries.
pub trait MessageCodec: Clone + 'static {
    /// Encode a serializable message to bytes.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Encode` if serialization fails.
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes to a deserializable message.
    ///
    /// # Errors
    ///
    /// Returns `CodecError::Decode` if deserialization fails.
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec using serde_json.
///
/// The default codec. Human-readable, which makes captured traffic easy to
/// inspect; swap in a binary codec for production use.
#[derive(Clone, Copy, Default, Debug)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(msg).map_err(|e| CodecError::Encode(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(buf).map_err(|e| CodecError::Decode(Box::new(e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec;
        let msg = TestMessage {
            id: 42,
            content: "hello world".to_string(),
        };

        let bytes = codec.encode(&msg).expect("encode should succeed");
        let decoded: TestMessage = codec.decode(&bytes).expect("decode should succeed");

        assert_eq!(msg, decoded);
    }

    #[test]
    fn test_json_codec_decode_error() {
        let codec = JsonCodec;

        let result: Result<TestMessage, CodecError> = codec.decode(b"not valid json {");
        let err = result.expect_err("should fail");
        assert!(matches!(err, CodecError::Decode(_)));
        assert!(err.to_string().contains("decode error"));
    }

    #[test]
    fn test_json_codec_type_mismatch() {
        let codec = JsonCodec;
        let bytes = codec.encode(&vec![1u8, 2, 3]).expect("encode");

        let result: Result<TestMessage, CodecError> = codec.decode(&bytes);
        assert!(result.is_err());
    }
}
