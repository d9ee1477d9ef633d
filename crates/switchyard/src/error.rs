//! Error kinds shared by every layer and their wire representation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind tag carried in error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Channel not open, or a send failed.
    Transport,
    /// No response within the deadline.
    Timeout,
    /// Remote process terminated mid-call.
    ConnectionLost,
    /// Denied by the permission enforcer.
    Authorization,
    /// Malformed envelope, stale correlation id, bad parameters, checksum mismatch.
    Protocol,
    /// Handler failed or panicked.
    Internal,
    /// Cancelled by the local caller. Never sent by a well-behaved peer.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection_lost",
            Self::Authorization => "authorization",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Error payload as it travels inside a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IpcError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("not authorized: {message}")]
    Authorization {
        message: String,
        details: Option<Value>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("internal error: {message}")]
    Internal {
        message: String,
        details: Option<Value>,
    },

    #[error("call cancelled")]
    Cancelled,
}

impl IpcError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            details: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport(_) => ErrorKind::Transport,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ConnectionLost(_) => ErrorKind::ConnectionLost,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let (message, details) = match self {
            Self::Transport(m)
            | Self::Timeout(m)
            | Self::ConnectionLost(m)
            | Self::Protocol(m) => (m.clone(), None),
            Self::Authorization { message, details } | Self::Internal { message, details } => {
                (message.clone(), details.clone())
            }
            Self::Cancelled => ("call cancelled".to_string(), None),
        };
        ErrorPayload {
            kind: self.kind(),
            message,
            details,
        }
    }

    pub fn from_payload(payload: ErrorPayload) -> Self {
        let ErrorPayload {
            kind,
            message,
            details,
        } = payload;
        match kind {
            ErrorKind::Transport => Self::Transport(message),
            ErrorKind::Timeout => Self::Timeout(message),
            ErrorKind::ConnectionLost => Self::ConnectionLost(message),
            ErrorKind::Authorization => Self::Authorization { message, details },
            ErrorKind::Protocol => Self::Protocol(message),
            ErrorKind::Internal => Self::Internal { message, details },
            ErrorKind::Cancelled => Self::Cancelled,
        }
    }
}

impl From<std::io::Error> for IpcError {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.to_string())
    }
}
