#![warn(missing_docs)]

//! BlobGate storage subsystem: blob identity, backend fetch tasks, metadata cache tier
//!
//! This crate holds the value types shared by every resolution strategy and
//! the collaborator traits the gateway talks to. The in-memory backend and
//! cache implementations back the `bg-gateway` binary and the test suites.

pub mod backend;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod identity;
pub mod record;

pub use backend::{BackendStats, Fault, MemoryBackend, MemoryBackendConfig, StorageBackend};
pub use cache::{CacheLookup, MemoryMetadataCache, MetadataCache};
pub use error::{StorageError, StorageResult};
pub use fetch::{FetchEvent, FetchKind, FetchSender, FetchStatus, FetchTask};
pub use identity::{BlobId, BlobIdentity, NamespaceMap};
pub use record::{BlobRecord, LifecycleFlags};
