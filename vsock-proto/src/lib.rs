//! Vsock wire protocol between host and guest agent.
//!
//! ## Wire Format
//!
//! ```text
//! [4-byte big-endian length][length bytes of UTF-8 JSON]
//! ```
//!
//! The JSON is an envelope `{"type": <int>, "payload": <raw JSON>}`.
//! Frames larger than the configured maximum (8 MiB by default) are
//! rejected before any payload allocation.
//!
//! ## Message Types
//!
//! | Type | Direction | Name   | Payload |
//! |------|-----------|--------|---------|
//! | 1    | H→G       | Init   | runtime, handler, env, limits |
//! | 2    | H→G       | Exec   | request id, input, timeout |
//! | 3    | G→H       | Resp   | request id, output, error, timings |
//! | 4    | H→G       | Ping   | (empty object) |
//! | 5    | H→G       | Stop   | (empty object) |
//! | 6    | H→G       | Reload | path → bytes map (base64) |
//! | 7    | G→H       | Stream | request id, data chunk (base64), is_last |
//!
//! Byte fields (`Stream.data`, `Reload.files` values) travel as base64
//! strings, matching the guest agent's JSON marshaling of raw bytes.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

/// Length prefix size.
pub const HEADER_SIZE: usize = 4;

/// Default maximum frame payload size (8 MiB).
pub const DEFAULT_MAX_FRAME: usize = 8 * 1024 * 1024;

/// Default vsock port the guest agent listens on.
pub const DEFAULT_AGENT_PORT: u32 = 5000;

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown message type: {0}")]
    UnknownType(u8),

    #[error("malformed payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Message type discriminants, shared with the guest agent.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Init = 1,
    Exec = 2,
    Resp = 3,
    Ping = 4,
    Stop = 5,
    Reload = 6,
    Stream = 7,
}

impl MsgType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Init),
            2 => Some(Self::Exec),
            3 => Some(Self::Resp),
            4 => Some(Self::Ping),
            5 => Some(Self::Stop),
            6 => Some(Self::Reload),
            7 => Some(Self::Stream),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// The outer message: a type tag plus the raw, untouched payload JSON.
#[derive(Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: u8,
    pub payload: Box<RawValue>,
}

impl Envelope {
    /// Wrap a payload value under a message type.
    pub fn new<T: Serialize>(msg_type: MsgType, payload: &T) -> Result<Self> {
        let raw = serde_json::value::to_raw_value(payload)?;
        Ok(Self {
            msg_type: msg_type as u8,
            payload: raw,
        })
    }

    /// An envelope with an empty `{}` payload (Ping, Stop).
    pub fn empty(msg_type: MsgType) -> Result<Self> {
        Self::new(msg_type, &serde_json::json!({}))
    }

    pub fn msg_type(&self) -> Result<MsgType> {
        MsgType::from_u8(self.msg_type).ok_or(ProtocolError::UnknownType(self.msg_type))
    }

    /// Decode the payload into a concrete type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_str(self.payload.get())?)
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Validate a declared frame length against the configured maximum.
///
/// Called on the raw length prefix before any allocation, so an adversarial
/// or corrupt peer cannot force a huge buffer.
pub fn validate_frame_len(len: u32, max: usize) -> Result<usize> {
    let len = len as usize;
    if len > max {
        return Err(ProtocolError::FrameTooLarge { len, max });
    }
    Ok(len)
}

/// Encode an envelope into a single `[length][json]` buffer.
///
/// One buffer means one `write` syscall per frame.
pub fn encode_frame(envelope: &Envelope, max: usize) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(envelope)?;
    if json.len() > max {
        return Err(ProtocolError::FrameTooLarge {
            len: json.len(),
            max,
        });
    }
    let mut buf = Vec::with_capacity(HEADER_SIZE + json.len());
    buf.extend_from_slice(&(json.len() as u32).to_be_bytes());
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Decode one complete frame from a byte slice.
///
/// Returns the envelope and the number of bytes consumed, or `None` when the
/// slice does not yet hold a full frame.
pub fn decode_frame(buf: &[u8], max: usize) -> Result<Option<(Envelope, usize)>> {
    let Some(header) = buf.get(..HEADER_SIZE) else {
        return Ok(None);
    };
    let mut len_bytes = [0u8; HEADER_SIZE];
    len_bytes.copy_from_slice(header);
    let len = validate_frame_len(u32::from_be_bytes(len_bytes), max)?;
    let Some(body) = buf.get(HEADER_SIZE..HEADER_SIZE + len) else {
        return Ok(None);
    };
    let envelope: Envelope = serde_json::from_slice(body)?;
    Ok(Some((envelope, HEADER_SIZE + len)))
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// A host directory the guest should expose to the function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Sent once per connection before the first `Exec`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    pub runtime: String,
    pub handler: String,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    pub function_name: String,
    pub function_version: String,
    pub memory_mb: u32,
    pub timeout_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layer_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts: Option<Vec<Mount>>,
}

/// One invocation request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecPayload {
    pub request_id: String,
    pub input: serde_json::Value,
    pub timeout_s: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceparent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracestate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

/// The agent's answer to `Exec`, `Ping`, and `Reload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RespPayload {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub output: serde_json::Value,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// One chunk of a streaming response. Chunks for a request id arrive in
/// send order; the last carries `is_last`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamPayload {
    pub request_id: String,
    #[serde(with = "serde_base64")]
    pub data: Vec<u8>,
    pub is_last: bool,
    #[serde(default)]
    pub error: String,
}

/// Pushes updated code files into a persistent-mode guest. Acknowledged
/// with a `Resp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadPayload {
    #[serde(with = "serde_base64_map")]
    pub files: HashMap<String, Vec<u8>>,
}

// ---------------------------------------------------------------------------
// Base64 byte fields
// ---------------------------------------------------------------------------

/// `Vec<u8>` as a base64 string, matching the agent's `[]byte` marshaling.
pub mod serde_base64 {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

/// `HashMap<String, Vec<u8>>` with base64 string values.
pub mod serde_base64_map {
    use std::collections::HashMap;

    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::ser::SerializeMap;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        files: &HashMap<String, Vec<u8>>,
        s: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = s.serialize_map(Some(files.len()))?;
        for (path, bytes) in files {
            map.serialize_entry(path, &STANDARD.encode(bytes))?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<HashMap<String, Vec<u8>>, D::Error> {
        let encoded: HashMap<String, String> = HashMap::deserialize(d)?;
        encoded
            .into_iter()
            .map(|(path, text)| {
                STANDARD
                    .decode(&text)
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_payload() -> ExecPayload {
        ExecPayload {
            request_id: "req-1".into(),
            input: serde_json::json!({"a": 1}),
            timeout_s: 5,
            traceparent: None,
            tracestate: None,
            stream: None,
        }
    }

    #[test]
    fn msg_type_round_trip() {
        for t in [
            MsgType::Init,
            MsgType::Exec,
            MsgType::Resp,
            MsgType::Ping,
            MsgType::Stop,
            MsgType::Reload,
            MsgType::Stream,
        ] {
            assert_eq!(MsgType::from_u8(t as u8), Some(t));
        }
        assert_eq!(MsgType::from_u8(0), None);
        assert_eq!(MsgType::from_u8(8), None);
    }

    #[test]
    fn envelope_json_shape() {
        let env = Envelope::new(MsgType::Exec, &exec_payload()).unwrap();
        let json: serde_json::Value = serde_json::to_value(&env).unwrap();
        assert_eq!(json["type"], 2);
        assert_eq!(json["payload"]["request_id"], "req-1");
    }

    #[test]
    fn frame_round_trip() {
        let env = Envelope::new(MsgType::Exec, &exec_payload()).unwrap();
        let frame = encode_frame(&env, DEFAULT_MAX_FRAME).unwrap();

        let (decoded, consumed) = decode_frame(&frame, DEFAULT_MAX_FRAME).unwrap().unwrap();
        assert_eq!(consumed, frame.len());
        assert_eq!(decoded.msg_type().unwrap(), MsgType::Exec);
        let payload: ExecPayload = decoded.parse().unwrap();
        assert_eq!(payload, exec_payload());
    }

    #[test]
    fn decode_partial_frame_returns_none() {
        let env = Envelope::empty(MsgType::Ping).unwrap();
        let frame = encode_frame(&env, DEFAULT_MAX_FRAME).unwrap();
        assert!(decode_frame(&frame[..2], DEFAULT_MAX_FRAME).unwrap().is_none());
        assert!(
            decode_frame(&frame[..frame.len() - 1], DEFAULT_MAX_FRAME)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn decode_consumes_one_frame_at_a_time() {
        let ping = encode_frame(&Envelope::empty(MsgType::Ping).unwrap(), 1024).unwrap();
        let stop = encode_frame(&Envelope::empty(MsgType::Stop).unwrap(), 1024).unwrap();
        let mut buf = ping.clone();
        buf.extend_from_slice(&stop);

        let (first, consumed) = decode_frame(&buf, 1024).unwrap().unwrap();
        assert_eq!(first.msg_type().unwrap(), MsgType::Ping);
        assert_eq!(consumed, ping.len());
        let (second, _) = decode_frame(&buf[consumed..], 1024).unwrap().unwrap();
        assert_eq!(second.msg_type().unwrap(), MsgType::Stop);
    }

    #[test]
    fn oversized_declared_length_rejected_from_header_alone() {
        // Only a header claiming 9 MiB; no body needed to reject.
        let header = (9 * 1024 * 1024u32).to_be_bytes();
        let err = decode_frame(&header, DEFAULT_MAX_FRAME).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let big = StreamPayload {
            request_id: "r".into(),
            data: vec![0u8; 64],
            is_last: false,
            error: String::new(),
        };
        let env = Envelope::new(MsgType::Stream, &big).unwrap();
        let err = encode_frame(&env, 16).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn validate_frame_len_bounds() {
        assert_eq!(validate_frame_len(100, 1024).unwrap(), 100);
        assert!(validate_frame_len(1025, 1024).is_err());
        assert_eq!(validate_frame_len(1024, 1024).unwrap(), 1024);
    }

    #[test]
    fn unknown_type_is_rejected_lazily() {
        let env = Envelope {
            msg_type: 42,
            payload: serde_json::value::to_raw_value(&serde_json::json!({})).unwrap(),
        };
        assert!(matches!(
            env.msg_type().unwrap_err(),
            ProtocolError::UnknownType(42)
        ));
    }

    #[test]
    fn init_payload_round_trip() {
        let init = InitPayload {
            runtime: "python".into(),
            handler: "main.handler".into(),
            env_vars: HashMap::from([("KEY".into(), "value".into())]),
            command: None,
            extension: None,
            mode: Some("process".into()),
            function_name: "hello".into(),
            function_version: "3".into(),
            memory_mb: 128,
            timeout_s: 5,
            layer_count: Some(2),
            volume_mounts: Some(vec![Mount {
                source: "/data".into(),
                target: "/mnt/data".into(),
                read_only: true,
            }]),
        };
        let env = Envelope::new(MsgType::Init, &init).unwrap();
        let back: InitPayload = env.parse().unwrap();
        assert_eq!(back, init);
    }

    #[test]
    fn init_payload_omits_absent_options() {
        let init = InitPayload {
            runtime: "python".into(),
            handler: "h".into(),
            env_vars: HashMap::new(),
            command: None,
            extension: None,
            mode: None,
            function_name: "f".into(),
            function_version: "1".into(),
            memory_mb: 128,
            timeout_s: 5,
            layer_count: None,
            volume_mounts: None,
        };
        let json = serde_json::to_string(&init).unwrap();
        assert!(!json.contains("command"));
        assert!(!json.contains("layer_count"));
        assert!(!json.contains("volume_mounts"));
    }

    #[test]
    fn resp_payload_tolerates_missing_fields() {
        let resp: RespPayload = serde_json::from_str(r#"{"request_id":"r1"}"#).unwrap();
        assert!(resp.error.is_empty());
        assert_eq!(resp.duration_ms, 0);
        assert_eq!(resp.output, serde_json::Value::Null);
    }

    #[test]
    fn stream_payload_data_is_base64() {
        let chunk = StreamPayload {
            request_id: "r1".into(),
            data: b"hello world".to_vec(),
            is_last: true,
            error: String::new(),
        };
        let json: serde_json::Value = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["data"], "aGVsbG8gd29ybGQ=");

        let back: StreamPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, chunk);
    }

    #[test]
    fn reload_files_are_base64_strings() {
        let reload = ReloadPayload {
            files: HashMap::from([("handler.py".to_string(), b"print(2)".to_vec())]),
        };
        let json: serde_json::Value = serde_json::to_value(&reload).unwrap();
        assert_eq!(json["files"]["handler.py"], "cHJpbnQoMik=");

        let back: ReloadPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back, reload);
    }

    #[test]
    fn reload_rejects_invalid_base64() {
        let json = r#"{"files":{"handler.py":"not base64!!"}}"#;
        assert!(serde_json::from_str::<ReloadPayload>(json).is_err());
    }
}
