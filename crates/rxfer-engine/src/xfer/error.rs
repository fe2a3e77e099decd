//! Engine error type.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a connection attempt failed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionFailure {
    /// Wrong username / password / key.
    Auth,
    /// TCP / DNS / handshake failure.
    Network,
    /// The connect call did not finish within the endpoint's connect timeout.
    Timeout,
    /// No session implementation for the endpoint's protocol.
    UnsupportedProtocol,
    /// No credentials in the descriptor and none supplied when asked.
    CredentialsRequired,
}

/// Categorised engine error.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum XferError {
    #[error("connection to {endpoint} failed ({failure:?}): {message}")]
    Connection {
        endpoint: String,
        failure: ConnectionFailure,
        message: String,
    },

    #[error("no pooled session for {endpoint} became available within {waited_ms}ms")]
    PoolExhausted { endpoint: String, waited_ms: u64 },

    #[error("transfer of {path} timed out after {timeout_secs}s")]
    TransferTimeout { path: String, timeout_secs: u64 },

    #[error("skipped {path}: target already exists")]
    CollisionSkipped { path: String },

    #[error("refusing recursive delete of protected path {path}")]
    DangerousPath { path: String },

    #[error("kept entries under {path}: {reason}")]
    IncompleteListing { path: String, reason: String },

    #[error("no connection to {endpoint}; connect first")]
    NoConnection { endpoint: String },

    #[error("{reason}")]
    Cancelled { reason: String },

    #[error("session error: {message}")]
    Session { message: String },

    #[error("I/O error: {message}")]
    Io { message: String },

    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("{operation} is not supported by this session")]
    Unsupported { operation: String },
}

pub type XferResult<T> = Result<T, XferError>;

// ── Construction helpers ─────────────────────────────────────────────

impl XferError {
    pub fn connection(
        endpoint: impl Into<String>,
        failure: ConnectionFailure,
        msg: impl Into<String>,
    ) -> Self {
        Self::Connection {
            endpoint: endpoint.into(),
            failure,
            message: msg.into(),
        }
    }

    pub fn session(msg: impl Into<String>) -> Self {
        Self::Session {
            message: msg.into(),
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::Io {
            message: msg.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: msg.into(),
        }
    }

    pub fn unsupported(operation: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
        }
    }

    pub fn cancelled_by_user() -> Self {
        Self::Cancelled {
            reason: "cancelled by user".to_string(),
        }
    }

    /// Stable machine-readable code, independent of the message text.
    pub fn code(&self) -> &'static str {
        match self {
            XferError::Connection { failure, .. } => match failure {
                ConnectionFailure::Auth => "CONNECTION_AUTH",
                ConnectionFailure::Network => "CONNECTION_NETWORK",
                ConnectionFailure::Timeout => "CONNECTION_TIMEOUT",
                ConnectionFailure::UnsupportedProtocol => "CONNECTION_UNSUPPORTED_PROTOCOL",
                ConnectionFailure::CredentialsRequired => "CONNECTION_CREDENTIALS_REQUIRED",
            },
            XferError::PoolExhausted { .. } => "POOL_EXHAUSTED",
            XferError::TransferTimeout { .. } => "TRANSFER_TIMEOUT",
            XferError::CollisionSkipped { .. } => "COLLISION_SKIPPED",
            XferError::DangerousPath { .. } => "DANGEROUS_PATH",
            XferError::IncompleteListing { .. } => "INCOMPLETE_LISTING",
            XferError::NoConnection { .. } => "NO_CONNECTION",
            XferError::Cancelled { .. } => "CANCELLED",
            XferError::Session { .. } => "SESSION",
            XferError::Io { .. } => "IO",
            XferError::InvalidConfig { .. } => "INVALID_CONFIG",
            XferError::Unsupported { .. } => "UNSUPPORTED",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, XferError::TransferTimeout { .. })
    }

    pub fn is_collision_skip(&self) -> bool {
        matches!(self, XferError::CollisionSkipped { .. })
    }
}

impl From<std::io::Error> for XferError {
    fn from(e: std::io::Error) -> Self {
        Self::io(e.to_string())
    }
}

impl From<XferError> for String {
    fn from(e: XferError) -> String {
        e.to_string()
    }
}
