use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ProxyError {
    #[error("Unknown session: {0}")]
    UnknownSession(String),

    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    #[error("Object {0} is not registered in this session")]
    ObjectNotFound(u64),

    #[error("Command '{command}' cannot be applied to a {kind}")]
    NotApplicable { command: String, kind: String },

    #[error("Database error: {message}")]
    Database {
        message: String,
        sql_state: Option<String>,
        vendor_code: i32,
    },

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Statement was cancelled")]
    Cancelled,

    #[error("Cursor error: {0}")]
    Cursor(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Rejected: {0}")]
    Rejected(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Reclamation error: {0}")]
    Reclamation(String),

    #[error("{0}")]
    Remote(RemoteError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

impl ProxyError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
            sql_state: None,
            vendor_code: 0,
        }
    }

    pub fn database_with_state(message: impl Into<String>, sql_state: &str) -> Self {
        Self::Database {
            message: message.into(),
            sql_state: Some(sql_state.to_string()),
            vendor_code: 0,
        }
    }

    /// Classification shared by local and remote errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnknownSession(_) | Self::MalformedCommand(_) | Self::Codec(_) => {
                ErrorKind::Protocol
            }
            Self::ObjectNotFound(_) | Self::NotApplicable { .. } | Self::Closed(_) => {
                ErrorKind::Target
            }
            Self::Database { .. }
            | Self::Unsupported(_)
            | Self::Cancelled
            | Self::Rejected(_)
            | Self::Config(_) => ErrorKind::Execution,
            Self::Cursor(_) | Self::Timeout(_) => ErrorKind::Pagination,
            Self::Reclamation(_) => ErrorKind::Reclamation,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Remote(remote) => remote.kind,
        }
    }

    /// True when a close path reported that closing is not supported.
    pub fn is_unsupported(&self) -> bool {
        match self {
            Self::Unsupported(_) => true,
            Self::Remote(remote) => remote.code == ErrorCode::Unsupported,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::Remote(remote) => remote.code == ErrorCode::Cancelled,
            _ => false,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Remote(remote) => remote.code,
            other => RemoteError::from(other.clone()).code,
        }
    }
}

impl From<rmp_serde::encode::Error> for ProxyError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProxyError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Codec(err.to_string())
    }
}

// ============================================================================
// Normalized wire shape
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Protocol,
    Target,
    Execution,
    Pagination,
    Reclamation,
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Protocol => "protocol",
            Self::Target => "target",
            Self::Execution => "execution",
            Self::Pagination => "pagination",
            Self::Reclamation => "reclamation",
            Self::Transport => "transport",
        };
        write!(f, "{}", name)
    }
}

/// Finer-grained code preserved across the wire so the client can tell
/// e.g. a cancellation from an ordinary database failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    UnknownSession,
    MalformedCommand,
    ObjectNotFound,
    NotApplicable,
    Database,
    Unsupported,
    Cancelled,
    Cursor,
    Timeout,
    Closed,
    Rejected,
    Codec,
    Transport,
    Config,
    Reclamation,
}

/// The one error shape clients ever see from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
    pub sql_state: Option<String>,
    pub vendor_code: i32,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.sql_state {
            Some(state) => write!(f, "remote {} error [{}]: {}", self.kind, state, self.message),
            None => write!(f, "remote {} error: {}", self.kind, self.message),
        }
    }
}

impl From<ProxyError> for RemoteError {
    fn from(err: ProxyError) -> Self {
        let kind = err.kind();
        let message = err.to_string();
        let (code, sql_state, vendor_code) = match err {
            ProxyError::Remote(remote) => return remote,
            ProxyError::Database {
                sql_state,
                vendor_code,
                ..
            } => (ErrorCode::Database, sql_state, vendor_code),
            ProxyError::UnknownSession(_) => (ErrorCode::UnknownSession, None, 0),
            ProxyError::MalformedCommand(_) => (ErrorCode::MalformedCommand, None, 0),
            ProxyError::ObjectNotFound(_) => (ErrorCode::ObjectNotFound, None, 0),
            ProxyError::NotApplicable { .. } => (ErrorCode::NotApplicable, None, 0),
            ProxyError::Unsupported(_) => (ErrorCode::Unsupported, None, 0),
            ProxyError::Cancelled => (ErrorCode::Cancelled, Some("57014".to_string()), 0),
            ProxyError::Cursor(_) => (ErrorCode::Cursor, None, 0),
            ProxyError::Timeout(_) => (ErrorCode::Timeout, None, 0),
            ProxyError::Closed(_) => (ErrorCode::Closed, None, 0),
            ProxyError::Rejected(_) => (ErrorCode::Rejected, None, 0),
            ProxyError::Codec(_) => (ErrorCode::Codec, None, 0),
            ProxyError::Transport(_) => (ErrorCode::Transport, None, 0),
            ProxyError::Config(_) => (ErrorCode::Config, None, 0),
            ProxyError::Reclamation(_) => (ErrorCode::Reclamation, None, 0),
        };

        Self {
            kind,
            code,
            message,
            sql_state,
            vendor_code,
        }
    }
}

impl From<RemoteError> for ProxyError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}
