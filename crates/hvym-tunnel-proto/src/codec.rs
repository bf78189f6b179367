//! Frame codec: one JSON-encoded [`Message`] per WebSocket text frame.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;

use crate::message::Message;

/// Errors from encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 field: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serialize a message into the text payload of a frame.
pub fn encode(msg: &Message) -> Result<String, CodecError> {
    Ok(serde_json::to_string(msg)?)
}

/// Parse one frame payload into a message.
pub fn decode(text: &str) -> Result<Message, CodecError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode raw bytes (request/response bodies, signatures) as base64.
pub fn encode_body(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

/// Decode a base64 field back into raw bytes.
pub fn decode_body(text: &str) -> Result<Vec<u8>, CodecError> {
    Ok(BASE64.decode(text)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let msg = Message::AuthOk {
            token: "tok".into(),
            endpoint: "https://gaddr1.tunnel.hvym.link".into(),
        };
        let text = encode(&msg).unwrap();
        assert_eq!(decode(&text).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let err = decode(r#"{"type":"warp_core_breach"}"#).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn decode_rejects_non_json() {
        assert!(decode("not json").is_err());
    }

    #[test]
    fn body_base64_round_trip() {
        let bytes = b"hello tunnel";
        let encoded = encode_body(bytes);
        assert_eq!(decode_body(&encoded).unwrap(), bytes);
    }

    #[test]
    fn decode_body_rejects_invalid_base64() {
        assert!(decode_body("!!not base64!!").is_err());
    }
}
