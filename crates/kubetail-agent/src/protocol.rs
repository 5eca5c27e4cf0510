//! Wire protocol between the CLI and node agents.
//!
//! Every frame is one JSON object on its own line, tagged by `kind`:
//!
//! ```text
//! {"kind":"request","id":1,"token":"...","body":{"type":"list_log_files","namespaces":["ns1"]}}
//! {"kind":"item","id":1,"item":{"type":"log_file","data":{...}}}
//! {"kind":"end","id":1}
//! {"kind":"error","id":1,"error":{"kind":"not_found","message":"..."}}
//! {"kind":"cancel","id":1}
//! ```
//!
//! Requests are multiplexed over one connection by `id`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use kubetail_k8s::PermissionError;
use kubetail_logs::LogError;
use kubetail_types::{LogFileMetadata, LogFileWatchEvent, LogRecord, LogStreamRequest};

use crate::error::Result;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Request {
        id: u64,
        /// Caller's bearer token, forwarded to access reviews
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
        body: AgentRequest,
    },
    Item {
        id: u64,
        item: AgentItem,
    },
    End {
        id: u64,
    },
    Error {
        id: u64,
        error: RemoteError,
    },
    Cancel {
        id: u64,
    },
}

impl Frame {
    pub fn id(&self) -> u64 {
        match self {
            Self::Request { id, .. }
            | Self::Item { id, .. }
            | Self::End { id }
            | Self::Error { id, .. }
            | Self::Cancel { id } => *id,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    ListLogFiles { namespaces: Vec<String> },
    WatchLogFiles { namespaces: Vec<String> },
    StreamForward(LogStreamRequest),
    StreamBackward(LogStreamRequest),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum AgentItem {
    LogFile(LogFileMetadata),
    WatchEvent(LogFileWatchEvent),
    Record(LogRecord),
}

/// Error category reported by an agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    Unauthenticated,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "invalid_argument",
            Self::NotFound => "not_found",
            Self::Unauthenticated => "unauthenticated",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error reported by an agent for one request
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&PermissionError> for RemoteError {
    fn from(err: &PermissionError) -> Self {
        let kind = match err {
            PermissionError::NamespacesRequired => ErrorKind::InvalidArgument,
            PermissionError::Denied { .. } => ErrorKind::Unauthenticated,
            PermissionError::Timeout(_) | PermissionError::Review(_) => ErrorKind::Internal,
        };
        Self::new(kind, err.to_string())
    }
}

impl From<&LogError> for RemoteError {
    fn from(err: &LogError) -> Self {
        match err {
            LogError::Permission(e) => e.into(),
            LogError::NotFound(_) => Self::new(ErrorKind::NotFound, err.to_string()),
            e if e.is_input_error() => Self::new(ErrorKind::InvalidArgument, err.to_string()),
            _ => Self::new(ErrorKind::Internal, err.to_string()),
        }
    }
}

/// Reads newline-delimited frames
pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner).lines(),
        }
    }

    /// Next frame, or `None` at end of stream. Blank lines are skipped.
    pub async fn next(&mut self) -> Result<Option<Frame>> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return Ok(Some(serde_json::from_str(&line)?));
        }
        Ok(None)
    }
}

/// Writes newline-delimited frames
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let mut buf = serde_json::to_vec(frame)?;
        buf.push(b'\n');
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use kubetail_k8s::Verb;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let frame = Frame::Request {
            id: 1,
            token: None,
            body: AgentRequest::ListLogFiles {
                namespaces: vec!["ns1".to_string()],
            },
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "kind": "request",
                "id": 1,
                "body": {"type": "list_log_files", "namespaces": ["ns1"]}
            })
        );
    }

    #[test]
    fn test_stream_request_wire_format() {
        let frame = Frame::Request {
            id: 7,
            token: Some("t".to_string()),
            body: AgentRequest::StreamForward(LogStreamRequest::new("ns", "pod", "c", "abc")),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["token"], "t");
        assert_eq!(value["body"]["type"], "stream_forward");
        assert_eq!(value["body"]["podName"], "pod");
        assert_eq!(value["body"]["containerID"], "abc");

        let parsed: Frame = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_error_frame_wire_format() {
        let frame = Frame::Error {
            id: 3,
            error: RemoteError::new(ErrorKind::NotFound, "missing"),
        };
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"kind": "error", "id": 3, "error": {"kind": "not_found", "message": "missing"}})
        );
        assert_eq!(frame.id(), 3);
    }

    #[test]
    fn test_remote_error_from_log_error() {
        let cases = [
            (LogError::NamespacesRequired, ErrorKind::InvalidArgument),
            (LogError::MalformedFileName("x".to_string()), ErrorKind::InvalidArgument),
            (LogError::NotFound(PathBuf::from("/x.log")), ErrorKind::NotFound),
            (
                LogError::Permission(PermissionError::Denied {
                    verb: Verb::Get,
                    namespace: "ns1".to_string(),
                    reason: String::new(),
                }),
                ErrorKind::Unauthenticated,
            ),
            (
                LogError::Permission(PermissionError::NamespacesRequired),
                ErrorKind::InvalidArgument,
            ),
            (
                LogError::Io(std::io::Error::other("boom")),
                ErrorKind::Internal,
            ),
        ];

        for (err, kind) in cases {
            let remote = RemoteError::from(&err);
            assert_eq!(remote.kind, kind, "{err}");
            assert_eq!(remote.message, err.to_string());
        }
    }

    #[tokio::test]
    async fn test_reader_and_writer_over_pipe() {
        let (client, server) = tokio::io::duplex(1024);
        let mut writer = FrameWriter::new(client);
        let mut reader = FrameReader::new(server);

        writer.send(&Frame::Cancel { id: 9 }).await.unwrap();
        writer.send(&Frame::End { id: 10 }).await.unwrap();
        drop(writer);

        assert_eq!(reader.next().await.unwrap(), Some(Frame::Cancel { id: 9 }));
        assert_eq!(reader.next().await.unwrap(), Some(Frame::End { id: 10 }));
        assert_eq!(reader.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reader_rejects_garbage() {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(b"\nnot json\n").await.unwrap();
        drop(client);

        let mut reader = FrameReader::new(server);
        assert!(reader.next().await.is_err());
    }
}
