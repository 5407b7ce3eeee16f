//! Newline-delimited JSON framing for socket transports.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const CURRENT_PROTOCOL_VERSION: u16 = 1;

fn current_version() -> u16 {
    CURRENT_PROTOCOL_VERSION
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEnvelope {
    #[serde(default = "current_version")]
    pub version: u16,
    #[serde(flatten)]
    pub msg: WireMsg,
}

impl WireEnvelope {
    pub fn new(msg: WireMsg) -> Self {
        Self {
            version: CURRENT_PROTOCOL_VERSION,
            msg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum WireMsg {
    /// Consumer asks for a single reply on `channel`.
    Invoke(InvokePayload),
    /// Host answers an earlier invoke with the same id.
    Reply(ReplyPayload),
    /// Fire-and-forget message, either direction.
    Send(SendPayload),
    /// Consumer reloaded or navigated away.
    Navigate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokePayload {
    pub id: u64,
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyPayload {
    pub id: u64,
    #[serde(default)]
    pub payload: Value,
    /// Set when the host could not route the invoke at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejected: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayload {
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8], max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn frames_are_newline_terminated_and_decode_back() {
        let envelope = WireEnvelope::new(WireMsg::Invoke(InvokePayload {
            id: 7,
            channel: "hostlink:call:kv:read".to_string(),
            payload: json!({"key": "theme"}),
        }));
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert_eq!(frame.last(), Some(&b'\n'));
        let decoded: WireEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn wire_shape_uses_type_and_payload() {
        let envelope = WireEnvelope::new(WireMsg::Send(SendPayload {
            channel: "c".to_string(),
            payload: Value::Null,
        }));
        let value = serde_json::to_value(&envelope).expect("encode");
        assert_eq!(
            value,
            json!({"version": 1, "type": "send", "payload": {"channel": "c", "payload": null}})
        );

        let navigate: WireEnvelope =
            serde_json::from_str(r#"{"type":"navigate"}"#).expect("decode navigate");
        assert_eq!(navigate.msg, WireMsg::Navigate);
        assert_eq!(navigate.version, CURRENT_PROTOCOL_VERSION);
    }

    #[test]
    fn crlf_terminated_frames_decode() {
        let decoded: WireEnvelope = decode_frame(
            b"{\"type\":\"reply\",\"payload\":{\"id\":1,\"payload\":{\"value\":2}}}\r\n",
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        let WireMsg::Reply(reply) = decoded.msg else {
            panic!("expected reply")
        };
        assert_eq!(reply.id, 1);
        assert!(reply.rejected.is_none());
    }

    #[test]
    fn oversized_payloads_are_rejected_both_ways() {
        let envelope = WireEnvelope::new(WireMsg::Send(SendPayload {
            channel: "blob".to_string(),
            payload: json!("x".repeat(256)),
        }));
        assert!(matches!(
            encode_frame(&envelope, 64),
            Err(FrameError::OversizedFrame { .. })
        ));

        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            decode_frame::<WireEnvelope>(&frame, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn malformed_frame_reports_decode_error() {
        let result = decode_frame::<WireEnvelope>(b"{\"type\":\n", DEFAULT_MAX_FRAME_BYTES);
        assert!(matches!(result, Err(FrameError::Decode(_))));
    }
}
