//! The host <-> sandbox frame protocol.
//!
//! One JSON object per line, UTF-8, no embedded newlines. The sandbox writes
//! `request`, `stdout`, `stderr` and `done` frames on its stdout; the host
//! writes `response` frames to its stdin. Lines are bounded at
//! [`MAX_FRAME_BYTES`]; anything longer or unparsable is a protocol error
//! that terminates the invocation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::BridgeError;

/// Upper bound for one frame line.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Response {
        id: u64,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<FrameError>,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    Done {
        status: DoneStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoneStatus {
    Ok,
    Error,
}

impl Frame {
    pub fn response_ok(id: u64, result: Value) -> Self {
        Frame::Response {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn response_err(id: u64, err: &BridgeError) -> Self {
        Frame::Response {
            id,
            ok: false,
            result: None,
            error: Some(FrameError {
                code: err.kind().to_string(),
                message: err.to_string(),
            }),
        }
    }
}

/// Decodes one line into a frame.
pub fn decode(line: &[u8]) -> Result<Frame, BridgeError> {
    if line.len() > MAX_FRAME_BYTES {
        return Err(BridgeError::Protocol(format!(
            "frame exceeds {MAX_FRAME_BYTES} bytes"
        )));
    }
    let text = std::str::from_utf8(line)
        .map_err(|_| BridgeError::Protocol("frame is not valid UTF-8".to_string()))?;
    serde_json::from_str(text)
        .map_err(|err| BridgeError::Protocol(format!("malformed frame: {err}")))
}

/// Encodes a frame as one newline-terminated line.
pub fn encode(frame: &Frame) -> String {
    // Frames are build-controlled plain data; serialization cannot fail.
    let mut line = serde_json::to_string(frame).unwrap_or_default();
    line.push('\n');
    line
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    writer.write_all(encode(frame).as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(frame: Frame) {
        let line = encode(&frame);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1, "no embedded newlines");
        let decoded = decode(line.trim_end().as_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn every_kind_round_trips() {
        roundtrip(Frame::Request {
            id: 1,
            method: "call_tool".into(),
            params: serde_json::json!({ "server": "stub", "tool": "echo" }),
        });
        roundtrip(Frame::response_ok(2, serde_json::json!({ "value": 3 })));
        roundtrip(Frame::response_err(
            3,
            &BridgeError::UnknownServer("ghost".into()),
        ));
        roundtrip(Frame::Stdout {
            data: "hello\n".into(),
        });
        roundtrip(Frame::Stderr {
            data: "oops".into(),
        });
        roundtrip(Frame::Done {
            status: DoneStatus::Ok,
            error: None,
        });
        roundtrip(Frame::Done {
            status: DoneStatus::Error,
            error: Some("boom".into()),
        });
    }

    #[test]
    fn error_responses_carry_stable_codes() {
        let frame = Frame::response_err(7, &BridgeError::SandboxTimeout(4));
        let Frame::Response { ok, error, .. } = &frame else {
            panic!("expected response");
        };
        assert!(!ok);
        assert_eq!(error.as_ref().unwrap().code, "sandbox_timeout");
    }

    #[test]
    fn unknown_kind_is_a_protocol_error() {
        let err = decode(br#"{"kind":"mystery","data":1}"#).unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn non_utf8_is_a_protocol_error() {
        let err = decode(&[0xff, 0xfe, b'{', b'}']).unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn missing_params_defaults_to_null() {
        let frame = decode(br#"{"kind":"request","id":9,"method":"list_servers"}"#).unwrap();
        assert_eq!(
            frame,
            Frame::Request {
                id: 9,
                method: "list_servers".into(),
                params: Value::Null,
            }
        );
    }
}
