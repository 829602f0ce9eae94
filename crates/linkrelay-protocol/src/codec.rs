//! Codec trait and implementation for credential blobs.
//!
//! Credential blobs are JSON trees that may contain binary key material.
//! Binary values travel as *tagged* objects:
//!
//! ```text
//! { "type": "Buffer", "data": "q83vEjRW" }      ← canonical (base64)
//! { "type": "Buffer", "data": [171, 205, 239] } ← accepted, normalized on encode
//! ```
//!
//! Decoding happens in two stages:
//!
//! 1. **Structural parse** — is this valid JSON at all?
//! 2. **Revival** — does every tagged binary value decode to real bytes?
//!
//! [`Codec::decode`] runs both. [`Codec::decode_structural`] runs only the
//! first, which is what the credential store falls back to when a blob
//! parses but its binary values are damaged (the "salvage" path).

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};

use crate::ProtocolError;

/// The `type` marker of a tagged binary value.
const BUFFER_TAG: &str = "Buffer";

/// Converts credential values to text for storage and back.
///
/// - `Send + Sync` → one codec is shared by every store task.
/// - `'static` → it owns everything it needs.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value, normalizing tagged binary values to base64.
    ///
    /// # Errors
    /// [`ProtocolError::Revive`] if a tagged binary value is malformed,
    /// [`ProtocolError::Encode`] if serialization itself fails.
    fn encode(&self, value: &Value) -> Result<String, ProtocolError>;

    /// Parses text and revives every tagged binary value.
    ///
    /// # Errors
    /// [`ProtocolError::Decode`] for invalid JSON,
    /// [`ProtocolError::Revive`] for damaged binary values.
    fn decode(&self, data: &str) -> Result<Value, ProtocolError>;

    /// Parses text without the revival stage.
    ///
    /// # Errors
    /// [`ProtocolError::Decode`] for invalid JSON.
    fn decode_structural(&self, data: &str) -> Result<Value, ProtocolError>;
}

// ---------------------------------------------------------------------------
// BufferJsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that stores credentials as JSON with base64-tagged buffers.
///
/// ## Example
///
/// ```rust
/// use linkrelay_protocol::{BufferJsonCodec, Codec, buffer_value};
/// use serde_json::json;
///
/// let codec = BufferJsonCodec;
/// let creds = json!({ "noiseKey": { "private": buffer_value(&[1, 2, 3]) } });
///
/// let text = codec.encode(&creds).unwrap();
/// let back = codec.decode(&text).unwrap();
/// assert_eq!(back, creds);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct BufferJsonCodec;

impl Codec for BufferJsonCodec {
    fn encode(&self, value: &Value) -> Result<String, ProtocolError> {
        let mut normalized = value.clone();
        normalize_buffers(&mut normalized, &mut String::from("$"))?;
        serde_json::to_string(&normalized).map_err(ProtocolError::Encode)
    }

    fn decode(&self, data: &str) -> Result<Value, ProtocolError> {
        let mut value = self.decode_structural(data)?;
        normalize_buffers(&mut value, &mut String::from("$"))?;
        Ok(value)
    }

    fn decode_structural(&self, data: &str) -> Result<Value, ProtocolError> {
        serde_json::from_str(data).map_err(ProtocolError::Decode)
    }
}

/// Wraps raw bytes in the canonical tagged form.
pub fn buffer_value(bytes: &[u8]) -> Value {
    let mut map = Map::new();
    map.insert("type".into(), Value::String(BUFFER_TAG.into()));
    map.insert("data".into(), Value::String(STANDARD.encode(bytes)));
    Value::Object(map)
}

/// Extracts the bytes from a canonical tagged value, if it is one.
pub fn value_bytes(value: &Value) -> Option<Vec<u8>> {
    let map = value.as_object()?;
    if map.get("type")?.as_str()? != BUFFER_TAG {
        return None;
    }
    STANDARD.decode(map.get("data")?.as_str()?).ok()
}

/// Walks the tree and rewrites every tagged binary value to canonical
/// base64, failing on the first one that cannot be decoded.
///
/// `path` is a JSONPath-ish breadcrumb used only for error messages.
fn normalize_buffers(value: &mut Value, path: &mut String) -> Result<(), ProtocolError> {
    match value {
        Value::Object(map) if is_buffer_tag(map) => {
            let canonical = match map.get("data") {
                Some(Value::String(encoded)) => {
                    STANDARD.decode(encoded).map_err(|e| revive_error(path, e))?;
                    return Ok(());
                }
                Some(Value::Array(items)) => {
                    let mut bytes = Vec::with_capacity(items.len());
                    for item in items {
                        let byte = item
                            .as_u64()
                            .and_then(|n| u8::try_from(n).ok())
                            .ok_or_else(|| revive_error(path, "byte out of range"))?;
                        bytes.push(byte);
                    }
                    STANDARD.encode(bytes)
                }
                Some(_) => return Err(revive_error(path, "data is neither string nor array")),
                None => return Err(revive_error(path, "missing data")),
            };
            map.insert("data".into(), Value::String(canonical));
            Ok(())
        }
        Value::Object(map) => {
            for (key, child) in map.iter_mut() {
                let len = path.len();
                path.push('.');
                path.push_str(key);
                normalize_buffers(child, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, child) in items.iter_mut().enumerate() {
                let len = path.len();
                path.push_str(&format!("[{i}]"));
                normalize_buffers(child, path)?;
                path.truncate(len);
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn is_buffer_tag(map: &Map<String, Value>) -> bool {
    map.get("type").and_then(Value::as_str) == Some(BUFFER_TAG)
}

fn revive_error(path: &str, reason: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::Revive {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_encode_decode_preserves_nested_buffers() {
        let codec = BufferJsonCodec;
        let value = json!({
            "signedPreKey": {
                "keyPair": { "public": buffer_value(&[9, 8, 7]) },
                "keyId": 1
            },
            "list": [buffer_value(b"abc"), 3]
        });

        let text = codec.encode(&value).unwrap();
        let decoded = codec.decode(&text).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn test_encode_normalizes_array_buffers_to_base64() {
        let codec = BufferJsonCodec;
        let value = json!({ "key": { "type": "Buffer", "data": [1, 2, 3] } });

        let text = codec.encode(&value).unwrap();
        let decoded = codec.decode(&text).unwrap();

        assert_eq!(value_bytes(&decoded["key"]), Some(vec![1, 2, 3]));
        assert!(text.contains("AQID"), "expected base64 in {text}");
    }

    #[test]
    fn test_decode_damaged_buffer_fails_revival_but_parses_structurally() {
        let codec = BufferJsonCodec;
        let text = r#"{"key":{"type":"Buffer","data":"!!not base64!!"},"id":"x"}"#;

        let err = codec.decode(text).unwrap_err();
        assert!(
            matches!(&err, ProtocolError::Revive { path, .. } if path == "$.key"),
            "got {err:?}"
        );

        let salvaged = codec.decode_structural(text).unwrap();
        assert_eq!(salvaged["id"], "x");
    }

    #[test]
    fn test_decode_garbage_fails_both_stages() {
        let codec = BufferJsonCodec;

        assert!(matches!(codec.decode("{\"trunc"), Err(ProtocolError::Decode(_))));
        assert!(matches!(
            codec.decode_structural("{\"trunc"),
            Err(ProtocolError::Decode(_))
        ));
    }

    #[test]
    fn test_encode_rejects_out_of_range_byte() {
        let codec = BufferJsonCodec;
        let value = json!({ "k": [{ "type": "Buffer", "data": [1, 300] }] });

        let err = codec.encode(&value).unwrap_err();

        assert!(matches!(&err, ProtocolError::Revive { path, .. } if path == "$.k[0]"));
    }

    #[test]
    fn test_value_bytes_ignores_untagged_values() {
        assert_eq!(value_bytes(&json!({ "data": "AQID" })), None);
        assert_eq!(value_bytes(&json!("AQID")), None);
        assert_eq!(value_bytes(&buffer_value(&[5])), Some(vec![5]));
    }
}
