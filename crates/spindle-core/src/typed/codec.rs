//! PayloadCodec - 値と永続化 JSON の相互変換
//!
//! Step outputs and workflow results are persisted as JSON columns. The
//! codec caps the encoded size at 1 MiB so one oversized step cannot bloat
//! the `steps` table.

use serde::de::DeserializeOwned;
use serde::Serialize;

pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload size exceeds maximum limit of 1MB ({size} bytes)")]
    TooLarge { size: usize },

    #[error("failed to serialize data: {0}")]
    Serialize(String),

    #[error("failed to deserialize data: {0}")]
    Deserialize(String),
}

/// Serialize `value` into a JSON value, rejecting anything over the limit.
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<serde_json::Value, CodecError> {
    let bytes = serde_json::to_vec(value).map_err(|e| CodecError::Serialize(e.to_string()))?;
    if bytes.len() > MAX_PAYLOAD_BYTES {
        return Err(CodecError::TooLarge { size: bytes.len() });
    }
    serde_json::from_slice(&bytes).map_err(|e| CodecError::Serialize(e.to_string()))
}

/// A missing payload decodes like JSON `null` (so `Option<T>` and `()` work).
pub fn decode<T: DeserializeOwned>(value: Option<serde_json::Value>) -> Result<T, CodecError> {
    serde_json::from_value(value.unwrap_or(serde_json::Value::Null))
        .map_err(|e| CodecError::Deserialize(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn oversized_payload_is_rejected() {
        let big = "x".repeat(MAX_PAYLOAD_BYTES);
        assert!(matches!(encode(&big), Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn missing_payload_decodes_as_null() {
        let _: () = decode(None).unwrap();
        let none: Option<u32> = decode(None).unwrap();
        assert_eq!(none, None);
    }

    #[test]
    fn type_mismatch_is_a_decode_error() {
        let err = decode::<u32>(Some(json!("seven"))).unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }
}
