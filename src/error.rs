//! Error taxonomy for the whole access layer.
//!
//! Every failure that can cross the pipeline boundary is one of these
//! kinds. The kind name is stable and is what transport adapters key
//! their status mapping on; the message is human-readable and never
//! carries credential material or file contents.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScoutError {
    /// A caller-supplied value failed a validator check.
    #[error("{0}")]
    Validation(String),

    /// The target named a host that is not in the inventory.
    #[error("unknown host '{host}'; available hosts: {}", available.join(", "))]
    UnknownHost {
        host: String,
        available: Vec<String>,
    },

    /// Missing or wrong API key. Deliberately detail-free.
    #[error("authentication failed")]
    Auth,

    /// The client's token bucket is empty.
    #[error("rate limit exceeded, retry in {retry_after:.1}s")]
    RateLimited { retry_after: f64 },

    /// Dialing the host failed (network, handshake, host key, auth).
    #[error("connection to '{host}' failed: {reason}")]
    Connection { host: String, reason: String },

    /// A remote command that was expected to succeed returned non-zero.
    #[error("remote command on '{host}' exited {exit_code}: {stderr}")]
    Remote {
        host: String,
        stderr: String,
        exit_code: u32,
    },

    /// `stat` reported the path missing.
    #[error("path not found on '{host}': {path}")]
    PathNotFound { host: String, path: String },

    /// A streaming transfer failed part-way.
    #[error("transfer failed after {bytes_written} bytes: {reason}")]
    Transfer { bytes_written: u64, reason: String },

    /// Propagation of an upstream cancellation. Not logged as an error.
    #[error("operation cancelled")]
    Cancelled,
}

impl ScoutError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn connection(host: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Connection {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable kind name, used by transport adapters and in tool-entry
    /// error text.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::UnknownHost { .. } => "UnknownHost",
            Self::Auth => "AuthError",
            Self::RateLimited { .. } => "RateLimitError",
            Self::Connection { .. } => "ConnectionError",
            Self::Remote { .. } => "RemoteError",
            Self::PathNotFound { .. } => "PathNotFound",
            Self::Transfer { .. } => "TransferError",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Transport-level status code for the adapter.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::UnknownHost { .. } | Self::PathNotFound { .. } => 404,
            Self::Auth => 401,
            Self::RateLimited { .. } => 429,
            Self::Connection { .. } => 502,
            Self::Remote { .. } | Self::Transfer { .. } => 500,
            Self::Cancelled => 499,
        }
    }

    /// True for transport-level failures the dispatcher is allowed to
    /// retry once after evicting the pooled session.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. })
    }
}

pub type Result<T> = std::result::Result<T, ScoutError>;
