use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command name that takes the lightweight liveness path instead of a full envelope
pub const PING_COMMAND: &str = "ping";

/// Maximum number of characters of a malformed reply kept for diagnostics
pub const PREVIEW_CHARS: usize = 500;

/// Request sent to the Unity Editor: `{"type": ..., "cmd": ...}`
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandEnvelope {
    #[serde(rename = "type")]
    pub command_type: String,
    pub cmd: Value,
}

impl CommandEnvelope {
    /// Creates a new envelope. A `null` payload is sent as an empty object.
    pub fn new(command_type: impl Into<String>, cmd: Value) -> Self {
        let cmd = if cmd.is_null() {
            Value::Object(Default::default())
        } else {
            cmd
        };
        Self {
            command_type: command_type.into(),
            cmd,
        }
    }

    /// Serializes the envelope to UTF-8 JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, BridgeError> {
        serde_json::to_vec(self).map_err(|e| BridgeError::Protocol {
            message: format!("Failed to serialize command '{}': {}", self.command_type, e),
            preview: String::new(),
        })
    }
}

/// Status reported by the Unity Editor for a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// Reply received from the Unity Editor
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseEnvelope {
    pub status: ResponseStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ResponseEnvelope {
    /// Parses a raw reply. Bytes that are not a valid envelope become a `Protocol` error
    /// carrying a truncated preview of what was received.
    pub fn parse(data: &[u8]) -> Result<Self, BridgeError> {
        serde_json::from_slice(data).map_err(|e| BridgeError::Protocol {
            message: format!("Invalid JSON response from Unity: {}", e),
            preview: preview(data),
        })
    }

    /// Converts the envelope into the command result, surfacing remote failures
    pub fn into_result(self) -> Result<Value, BridgeError> {
        match self.status {
            ResponseStatus::Success => Ok(self
                .result
                .unwrap_or_else(|| Value::Object(Default::default()))),
            ResponseStatus::Error => {
                let message = self
                    .error
                    .filter(|e| !e.is_empty())
                    .or(self.message)
                    .unwrap_or_else(|| "Unknown Unity error".to_string());
                Err(BridgeError::RemoteCommand(message))
            }
        }
    }
}

/// Truncated, lossy UTF-8 rendering of raw bytes for log and error messages
pub fn preview(data: &[u8]) -> String {
    let text = String::from_utf8_lossy(data);
    if text.chars().count() > PREVIEW_CHARS {
        let truncated: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", truncated)
    } else {
        text.into_owned()
    }
}

/// What went wrong when a transport could not be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailureKind {
    /// An operation did not finish within its configured timeout
    Timeout,
    /// Nothing accepted the connection
    Refused,
    /// The peer reset or aborted the connection
    Reset,
    /// The peer closed the connection or the pipe broke
    Closed,
    /// Discovery found no usable Unity server
    NoServer,
    /// Any other I/O level failure
    Io,
}

impl ConnectionFailureKind {
    fn as_str(&self) -> &'static str {
        match self {
            ConnectionFailureKind::Timeout => "timeout",
            ConnectionFailureKind::Refused => "refused",
            ConnectionFailureKind::Reset => "reset",
            ConnectionFailureKind::Closed => "closed",
            ConnectionFailureKind::NoServer => "no server",
            ConnectionFailureKind::Io => "io",
        }
    }
}

impl std::fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<std::io::ErrorKind> for ConnectionFailureKind {
    fn from(kind: std::io::ErrorKind) -> Self {
        use std::io::ErrorKind;
        match kind {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => ConnectionFailureKind::Timeout,
            ErrorKind::ConnectionRefused => ConnectionFailureKind::Refused,
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                ConnectionFailureKind::Reset
            }
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::NotConnected => {
                ConnectionFailureKind::Closed
            }
            _ => ConnectionFailureKind::Io,
        }
    }
}

/// Errors that can occur while talking to the Unity Editor
#[derive(Debug, Clone, thiserror::Error)]
pub enum BridgeError {
    #[error("Connection closed by Unity: expected {expected} bytes, received {received}")]
    TransportClosed { expected: usize, received: usize },
    #[error("Message too large: {size} bytes (max: {limit})")]
    MessageTooLarge { size: u64, limit: usize },
    #[error("{message}")]
    Protocol { message: String, preview: String },
    #[error("Unity error: {0}")]
    RemoteCommand(String),
    #[error("Connection error ({kind}): {message}")]
    Connection {
        kind: ConnectionFailureKind,
        message: String,
    },
}

impl BridgeError {
    /// Creates a connection error of the given kind
    pub fn connection(kind: ConnectionFailureKind, message: impl Into<String>) -> Self {
        BridgeError::Connection {
            kind,
            message: message.into(),
        }
    }

    /// Creates a timeout connection error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::connection(ConnectionFailureKind::Timeout, message)
    }

    /// Classifies an I/O error raised while using a transport
    pub fn from_io(context: &str, error: &std::io::Error) -> Self {
        Self::connection(error.kind().into(), format!("{}: {}", context, error))
    }

    /// Whether the failure means the transport itself is unusable, so the only remedy
    /// is to drop it and discover another port. Application level failures return false.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportClosed { .. }
                | BridgeError::MessageTooLarge { .. }
                | BridgeError::Connection { .. }
        )
    }

    /// The typed failure kind for connection errors
    pub fn connection_kind(&self) -> Option<ConnectionFailureKind> {
        match self {
            BridgeError::Connection { kind, .. } => Some(*kind),
            BridgeError::TransportClosed { .. } => Some(ConnectionFailureKind::Closed),
            _ => None,
        }
    }
}
