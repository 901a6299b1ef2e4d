//! Payload representation and log-safe rendering
//!
//! Callers hand the publisher raw bytes, text, or a JSON value. JSON values are
//! serialized with `serde_json`, whose default object map keeps keys sorted, so
//! the same value always produces the same bytes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payload as supplied by a caller (or an LWT configuration)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl Payload {
    /// Serialize to the bytes placed on the wire
    pub fn into_bytes(self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Text(text) => Ok(text.into_bytes()),
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Json(value) => serde_json::to_vec(&value),
        }
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<bytes::Bytes> for Payload {
    fn from(bytes: bytes::Bytes) -> Self {
        Payload::Bytes(bytes.to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Render a payload for a log line: binary becomes a size marker, long text is cut
pub fn sanitize_payload_for_logging(payload: &[u8], max_length: usize) -> String {
    let text = match std::str::from_utf8(payload) {
        Ok(text) => text,
        Err(_) => return format!("<binary data, {} bytes>", payload.len()),
    };

    match text.char_indices().nth(max_length) {
        Some((cut, _)) => format!("{}... ({} bytes total)", &text[..cut], payload.len()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload_is_canonical() {
        let a = Payload::from(json!({"b": 2, "a": 1})).into_bytes().unwrap();
        let b = Payload::from(json!({"a": 1, "b": 2})).into_bytes().unwrap();
        assert_eq!(a, b);
        assert_eq!(a, br#"{"a":1,"b":2}"#.to_vec());
    }

    #[test]
    fn test_text_and_bytes_pass_through() {
        assert_eq!(Payload::from("x").into_bytes().unwrap(), b"x".to_vec());
        assert_eq!(
            Payload::from(vec![0u8, 159, 146, 150]).into_bytes().unwrap(),
            vec![0u8, 159, 146, 150]
        );
    }

    #[test]
    fn test_untagged_deserialization() {
        let text: Payload = serde_json::from_str(r#""offline""#).unwrap();
        assert_eq!(text, Payload::Text("offline".to_string()));

        let object: Payload = serde_json::from_str(r#"{"status":"offline"}"#).unwrap();
        assert_eq!(object, Payload::Json(json!({"status": "offline"})));

        let bytes: Payload = serde_json::from_str("[1,2,3]").unwrap();
        assert_eq!(bytes, Payload::Bytes(vec![1, 2, 3]));
    }

    #[test]
    fn test_sanitize_binary() {
        assert_eq!(
            sanitize_payload_for_logging(&[0xff, 0xfe, 0x00], 100),
            "<binary data, 3 bytes>"
        );
    }

    #[test]
    fn test_sanitize_truncates_long_text() {
        let payload = "a".repeat(150);
        let rendered = sanitize_payload_for_logging(payload.as_bytes(), 100);
        assert_eq!(rendered, format!("{}... (150 bytes total)", "a".repeat(100)));
    }

    #[test]
    fn test_sanitize_short_text_unchanged() {
        assert_eq!(sanitize_payload_for_logging(b"21.5", 100), "21.5");
    }

    #[test]
    fn test_sanitize_multibyte_text() {
        let payload = "°C".repeat(10);
        let rendered = sanitize_payload_for_logging(payload.as_bytes(), 3);
        assert!(rendered.starts_with("°C°..."));
        assert!(rendered.ends_with(&format!("({} bytes total)", payload.len())));
    }
}
