//! Blob requests and their terminal outcomes.

use blobgate_storage::{BlobId, BlobIdentity};
use uuid::Uuid;

use crate::processor::ProcessorState;

/// "Fetch blob X for client Y".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobRequest {
    /// Unique id used for cancellation and logs
    pub request_id: Uuid,
    /// Blob to resolve
    pub blob_id: BlobId,
    /// Dedup key; requests without one skip delivery tracking
    pub client_id: Option<String>,
    /// Answer from the metadata cache tier only
    pub cache_only: bool,
    /// Expected last-modified stamp
    pub last_modified: Option<i64>,
    /// Reply "blob excluded" when the client already has (or is getting) it
    pub exclude_delivered: bool,
}

impl BlobRequest {
    /// A request for `blob_id` with every option off.
    pub fn new(blob_id: BlobId) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            blob_id,
            client_id: None,
            cache_only: false,
            last_modified: None,
            exclude_delivered: false,
        }
    }

    /// Sets the client the delivery is tracked for.
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Restricts metadata lookup to the cache.
    pub fn cache_only(mut self, cache_only: bool) -> Self {
        self.cache_only = cache_only;
        self
    }

    /// Requires the backend record to carry `last_modified`.
    pub fn with_last_modified(mut self, last_modified: i64) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Skips blobs already sent to the client.
    pub fn exclude_delivered(mut self, exclude: bool) -> Self {
        self.exclude_delivered = exclude;
        self
    }

    /// Fresh, unresolved identity for one processor.
    pub fn identity(&self) -> BlobIdentity {
        BlobIdentity::new(self.blob_id, self.last_modified)
    }
}

/// How one request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Status of the single terminal result written to the reply
    pub status: u16,
    /// Payload bytes accepted by the reply sink
    pub bytes_delivered: u64,
    /// Name of the winning processor, if any
    pub winner: Option<String>,
    /// Final state of every processor, in priority order
    pub states: Vec<(String, ProcessorState)>,
}

impl RequestOutcome {
    /// True for a 200 outcome.
    pub fn is_success(&self) -> bool {
        self.status == crate::error::STATUS_OK
    }

    /// Final state of the named processor.
    pub fn state_of(&self, name: &str) -> Option<ProcessorState> {
        self.states
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, state)| *state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let request = BlobRequest::new(BlobId::new(4, 1))
            .with_client("c1")
            .cache_only(true)
            .with_last_modified(42)
            .exclude_delivered(true);
        assert_eq!(request.client_id.as_deref(), Some("c1"));
        assert!(request.cache_only);
        assert!(request.exclude_delivered);
        assert_eq!(request.identity().last_modified(), Some(42));
        assert_eq!(request.identity().namespace(), None);
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = BlobRequest::new(BlobId::new(4, 1));
        let b = BlobRequest::new(BlobId::new(4, 1));
        assert_ne!(a.request_id, b.request_id);
    }

    #[test]
    fn test_outcome_state_lookup() {
        let outcome = RequestOutcome {
            status: 200,
            bytes_delivered: 3,
            winner: Some("p1".into()),
            states: vec![
                ("p1".into(), ProcessorState::Completed),
                ("p2".into(), ProcessorState::Canceled),
            ],
        };
        assert!(outcome.is_success());
        assert_eq!(outcome.state_of("p2"), Some(ProcessorState::Canceled));
        assert_eq!(outcome.state_of("p3"), None);
    }
}
