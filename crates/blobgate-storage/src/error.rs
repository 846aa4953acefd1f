//! Error types for the storage subsystem.

use thiserror::Error;

use crate::identity::BlobId;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants reported by backends, fetch tasks and the cache tier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The backend explicitly confirmed that the blob does not exist.
    #[error("blob {blob_id} not found in {namespace}")]
    NotFound {
        /// Namespace that was searched.
        namespace: String,
        /// The missing blob.
        blob_id: BlobId,
    },

    /// The storage class has no namespace mapping.
    #[error("cannot map storage class {storage_class} to a namespace")]
    UnknownStorageClass {
        /// The unmapped storage class.
        storage_class: i32,
    },

    /// Backend I/O failed or timed out.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend returned data that breaks the fetch contract.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The backend dropped the fetch without a terminal event.
    #[error("fetch abandoned by backend")]
    Abandoned,

    /// The backend or cache tier is not accepting requests.
    #[error("{component} is unavailable")]
    Unavailable {
        /// Name of the unavailable component.
        component: String,
    },
}

impl StorageError {
    /// True if the backend confirmed absence rather than failing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}
