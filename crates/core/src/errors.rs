//! Error types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Failure classes reported by connectors and the block feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Missing or placeholder endpoint/credential. Fatal to that component only.
    ConfigurationError,
    NetworkError,
    TimeoutError,
    /// Malformed or erroring upstream response
    ProtocolError,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            ErrorKind::ConfigurationError => "ConfigurationError",
            ErrorKind::NetworkError => "NetworkError",
            ErrorKind::TimeoutError => "TimeoutError",
            ErrorKind::ProtocolError => "ProtocolError",
        }
    }

    /// Network and timeout failures may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::NetworkError | ErrorKind::TimeoutError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A captured failure, carried as data rather than raised
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[error("{source_id} {kind}: {message}")]
pub struct ErrorDetail {
    pub source_id: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(source_id: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_id, ErrorKind::ConfigurationError, message)
    }

    pub fn network(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_id, ErrorKind::NetworkError, message)
    }

    pub fn timeout(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_id, ErrorKind::TimeoutError, message)
    }

    pub fn protocol(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(source_id, ErrorKind::ProtocolError, message)
    }
}

/// Outcome of one Source Connector call
pub type SourceResult<T> = Result<T, ErrorDetail>;

/// Block stream errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Subscriber already opened; create a new instance to reconnect")]
    AlreadyOpened,

    #[error(transparent)]
    Failed(#[from] ErrorDetail),
}

impl StreamError {
    pub fn detail(&self) -> Option<&ErrorDetail> {
        match self {
            StreamError::AlreadyOpened => None,
            StreamError::Failed(detail) => Some(detail),
        }
    }
}

/// Process-start configuration errors
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration load failed: {0}")]
    Config(#[from] config::ConfigError),
}

/// Result type alias
pub type CoreResult<T> = Result<T, CoreError>;
