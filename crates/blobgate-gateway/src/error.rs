//! Error types for BlobGate request resolution

use blobgate_storage::{BlobId, StorageError};
use thiserror::Error;

use crate::cancel::CancelReason;

/// HTTP status: success
pub const STATUS_OK: u16 = 200;
/// HTTP status: not found
pub const STATUS_NOT_FOUND: u16 = 404;
/// HTTP status: internal error
pub const STATUS_INTERNAL: u16 = 500;
/// HTTP status: service unavailable
pub const STATUS_UNAVAILABLE: u16 = 503;
/// HTTP status: gateway timeout
pub const STATUS_TIMEOUT: u16 = 504;

/// Severity attached to an error message written to the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Informational notice
    Info,
    /// Recoverable problem
    Warning,
    /// Request failed
    Error,
    /// Gateway-side fault
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Failures surfaced while resolving one blob request.
#[derive(Error, Debug)]
pub enum ResolveError {
    /// The storage class could not be mapped to a namespace
    #[error("cannot map storage class {storage_class} of blob {blob_id} to a namespace")]
    IdentityMapping {
        /// The requested blob
        blob_id: BlobId,
        /// The unmapped storage class
        storage_class: i32,
    },
    /// The metadata cache tier failed
    #[error("blob properties are not found due to a cache lookup error: {reason}")]
    CacheUnavailable {
        /// Cache-side failure text
        reason: String,
    },
    /// The blob does not exist
    #[error("blob {blob_id} not found: {reason}")]
    NotFound {
        /// The requested blob
        blob_id: BlobId,
        /// Where absence was established
        reason: String,
    },
    /// Backend I/O failed or timed out
    #[error("backend transport error: {0}")]
    Transport(String),
    /// Backend returned malformed data
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    /// No resolution strategy accepted the request
    #[error("no processor can handle blob {blob_id}")]
    NoProcessor {
        /// The requested blob
        blob_id: BlobId,
    },
    /// The request was canceled from outside before it finished
    #[error("request interrupted: {0}")]
    Interrupted(CancelReason),
    /// Invalid gateway configuration
    #[error("configuration error: {0}")]
    Config(String),
    /// Error passed through from the storage layer
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// I/O error (configuration loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolveError {
    /// HTTP-style status code reported to the client.
    pub fn http_status(&self) -> u16 {
        match self {
            ResolveError::IdentityMapping { .. }
            | ResolveError::NotFound { .. }
            | ResolveError::NoProcessor { .. } => STATUS_NOT_FOUND,
            ResolveError::Interrupted(CancelReason::DeadlineExceeded) => STATUS_TIMEOUT,
            ResolveError::Interrupted(_) => STATUS_UNAVAILABLE,
            ResolveError::Storage(err) => match err {
                StorageError::NotFound { .. } | StorageError::UnknownStorageClass { .. } => {
                    STATUS_NOT_FOUND
                }
                _ => STATUS_INTERNAL,
            },
            ResolveError::CacheUnavailable { .. }
            | ResolveError::Transport(_)
            | ResolveError::ProtocolViolation(_)
            | ResolveError::Config(_)
            | ResolveError::Io(_) => STATUS_INTERNAL,
        }
    }

    /// Severity used when the error is written to the reply.
    pub fn severity(&self) -> Severity {
        match self.http_status() {
            STATUS_NOT_FOUND => Severity::Error,
            STATUS_UNAVAILABLE | STATUS_TIMEOUT => Severity::Warning,
            _ => Severity::Critical,
        }
    }

    /// True if the error reports absence rather than a failure.
    pub fn is_not_found(&self) -> bool {
        self.http_status() == STATUS_NOT_FOUND
    }
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, ResolveError>;
