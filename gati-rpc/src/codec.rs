//! Module RPC wire codec.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! The contract is round-trip equivalence for structurally representable
//! values; nothing here depends on the transport.

use gati_core::error::RpcError;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; anything larger is a protocol violation.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// One module method invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallFrame {
    pub module: String,
    pub method: String,
    pub args: serde_json::Value,
    /// Milliseconds the callee has before the caller gives up.
    pub deadline_ms: u64,
    /// Attempt counter, 1-based; lets the callee deduplicate retries.
    pub attempt: u32,
}

/// Error payload carried in a reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub code: String,
    pub message: String,
    /// Explicit retry hint from the callee.
    #[serde(default)]
    pub retryable: bool,
}

/// Reply to one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyFrame {
    pub status: ReplyStatus,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Ok,
    Error,
}

impl ReplyFrame {
    pub fn ok(result: serde_json::Value) -> Self {
        ReplyFrame {
            status: ReplyStatus::Ok,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        ReplyFrame {
            status: ReplyStatus::Error,
            result: None,
            error: Some(WireError {
                code: code.into(),
                message: message.into(),
                retryable,
            }),
        }
    }
}

fn serialization_error(module: &str, method: &str, cause: impl std::fmt::Display) -> RpcError {
    RpcError::Serialization {
        module: module.to_string(),
        method: method.to_string(),
        cause: cause.to_string(),
    }
}

/// Encode a value into a length-prefixed frame.
pub fn encode<T: Serialize>(value: &T, module: &str, method: &str) -> Result<Vec<u8>, RpcError> {
    let body = serde_json::to_vec(value).map_err(|e| serialization_error(module, method, e))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(RpcError::Protocol {
            module: module.to_string(),
            method: method.to_string(),
            cause: format!("frame of {} bytes exceeds maximum", body.len()),
        });
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write one frame to the wire.
pub async fn write_frame<W, T>(
    writer: &mut W,
    value: &T,
    module: &str,
    method: &str,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(value, module, method)?;
    writer.write_all(&frame).await.map_err(|e| RpcError::Transport {
        module: module.to_string(),
        method: method.to_string(),
        cause: e.to_string(),
        exhausted: false,
    })?;
    writer.flush().await.map_err(|e| RpcError::Transport {
        module: module.to_string(),
        method: method.to_string(),
        cause: e.to_string(),
        exhausted: false,
    })
}

/// Read one frame from the wire.
pub async fn read_frame<R, T>(reader: &mut R, module: &str, method: &str) -> Result<T, RpcError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(|e| RpcError::Transport {
            module: module.to_string(),
            method: method.to_string(),
            cause: e.to_string(),
            exhausted: false,
        })?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(RpcError::Protocol {
            module: module.to_string(),
            method: method.to_string(),
            cause: format!("peer announced frame of {len} bytes"),
        });
    }
    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| RpcError::Transport {
            module: module.to_string(),
            method: method.to_string(),
            cause: e.to_string(),
            exhausted: false,
        })?;
    serde_json::from_slice(&body).map_err(|e| serialization_error(module, method, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_round_trip() {
        let call = CallFrame {
            module: "users".to_string(),
            method: "find".to_string(),
            args: serde_json::json!({"id": 42}),
            deadline_ms: 1000,
            attempt: 1,
        };
        let mut wire = Vec::new();
        write_frame(&mut wire, &call, "users", "find").await.unwrap();
        let mut cursor = std::io::Cursor::new(wire);
        let back: CallFrame = read_frame(&mut cursor, "users", "find").await.unwrap();
        assert_eq!(back.method, "find");
        assert_eq!(back.args["id"], 42);
        assert_eq!(back.attempt, 1);
    }

    #[tokio::test]
    async fn truncated_frame_is_a_transport_error() {
        let call = ReplyFrame::ok(serde_json::json!([1, 2, 3]));
        let mut wire = Vec::new();
        write_frame(&mut wire, &call, "m", "f").await.unwrap();
        wire.truncate(wire.len() - 2);
        let mut cursor = std::io::Cursor::new(wire);
        let err = read_frame::<_, ReplyFrame>(&mut cursor, "m", "f").await.unwrap_err();
        assert!(matches!(err, RpcError::Transport { .. }));
    }

    #[tokio::test]
    async fn oversized_announcement_is_a_protocol_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&(u32::MAX).to_be_bytes());
        let mut cursor = std::io::Cursor::new(wire);
        let err = read_frame::<_, ReplyFrame>(&mut cursor, "m", "f").await.unwrap_err();
        assert!(matches!(err, RpcError::Protocol { .. }));
    }

    #[tokio::test]
    async fn garbage_body_is_a_serialization_error() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&4u32.to_be_bytes());
        wire.extend_from_slice(b"!!!!");
        let mut cursor = std::io::Cursor::new(wire);
        let err = read_frame::<_, ReplyFrame>(&mut cursor, "m", "f").await.unwrap_err();
        assert!(matches!(err, RpcError::Serialization { .. }));
    }

    #[test]
    fn reply_constructors() {
        let ok = ReplyFrame::ok(serde_json::json!(1));
        assert_eq!(ok.status, ReplyStatus::Ok);
        let err = ReplyFrame::error("db.down", "no database", true);
        assert_eq!(err.status, ReplyStatus::Error);
        assert!(err.error.unwrap().retryable);
    }
}
