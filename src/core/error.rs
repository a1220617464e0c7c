use crate::core::models::{EntityKey, ErrorClass};

/// Failures reported by the remote system of record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("request timed out")]
    Timeout,

    #[error("connection reset")]
    ConnectionReset,

    #[error("server returned status {status}")]
    Server { status: u16 },

    #[error("rejected: {reason}")]
    Validation { reason: String },

    #[error("conflict: {reason}")]
    Conflict { reason: String },

    #[error("not found")]
    NotFound,
}

impl RemoteError {
    /// 5xx and transport failures are retried, everything else is final.
    pub fn class(&self) -> ErrorClass {
        match self {
            RemoteError::Timeout | RemoteError::ConnectionReset => ErrorClass::Transient,
            RemoteError::Server { status } if *status >= 500 => ErrorClass::Transient,
            RemoteError::Server { .. }
            | RemoteError::Validation { .. }
            | RemoteError::Conflict { .. }
            | RemoteError::NotFound => ErrorClass::Terminal,
        }
    }
}

/// Errors surfaced to callers of the write/read API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyncError {
    #[error("invalid mutation: {0}")]
    Validation(String),

    #[error("item {key} not found")]
    NotFound { key: EntityKey },

    #[error("network unavailable: {0}")]
    TransientNetwork(String),

    #[error("item {key} changed on the server: {reason}")]
    Conflict { key: EntityKey, reason: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("remote error: {0}")]
    Remote(RemoteError),
}

impl SyncError {
    /// Map a remote failure for `key` into the caller-facing taxonomy.
    pub fn from_remote(key: &EntityKey, err: RemoteError) -> Self {
        match err {
            RemoteError::Timeout | RemoteError::ConnectionReset => {
                SyncError::TransientNetwork(err.to_string())
            }
            RemoteError::Server { status } if status >= 500 => {
                SyncError::TransientNetwork(err.to_string())
            }
            RemoteError::Validation { reason } => SyncError::Validation(reason),
            RemoteError::Conflict { reason } => SyncError::Conflict {
                key: key.clone(),
                reason,
            },
            RemoteError::NotFound => SyncError::NotFound { key: key.clone() },
            other => SyncError::Remote(other),
        }
    }

    /// Map a failed read. Outages are reported as such; anything else is
    /// passed through.
    pub fn from_fetch(err: RemoteError) -> Self {
        match err.class() {
            ErrorClass::Transient => SyncError::TransientNetwork(err.to_string()),
            ErrorClass::Terminal => SyncError::Remote(err),
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
