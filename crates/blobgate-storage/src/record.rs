//! Backend blob metadata.

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// Lifecycle bits stored alongside blob metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LifecycleFlags(u32);

impl LifecycleFlags {
    /// Blob was removed from circulation
    pub const DEAD: LifecycleFlags = LifecycleFlags(1);
    /// Blob is hidden from default listings
    pub const SUPPRESSED: LifecycleFlags = LifecycleFlags(1 << 1);
    /// Blob was withdrawn and must not be served
    pub const WITHDRAWN: LifecycleFlags = LifecycleFlags(1 << 2);
    /// Chunks are gzip-compressed
    pub const GZIP: LifecycleFlags = LifecycleFlags(1 << 3);
    /// Last integrity check failed
    pub const CHECK_FAILED: LifecycleFlags = LifecycleFlags(1 << 4);

    /// No flags set.
    pub const fn empty() -> Self {
        LifecycleFlags(0)
    }

    /// Raw bit representation.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits (unknown bits are kept).
    pub const fn from_bits(bits: u32) -> Self {
        LifecycleFlags(bits)
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: LifecycleFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns the union of both flag sets.
    pub const fn with(self, other: LifecycleFlags) -> Self {
        LifecycleFlags(self.0 | other.0)
    }
}

/// Metadata returned by the backend for one blob.
///
/// Records are immutable once built; whoever fetched one shares it by clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    size: u64,
    chunk_count: u32,
    compressed: bool,
    flags: LifecycleFlags,
    last_modified: i64,
}

impl BlobRecord {
    /// Creates a record.
    pub fn new(size: u64, chunk_count: u32, last_modified: i64) -> Self {
        Self {
            size,
            chunk_count,
            compressed: false,
            flags: LifecycleFlags::empty(),
            last_modified,
        }
    }

    /// Marks the payload as compressed.
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Sets lifecycle flags.
    pub fn with_flags(mut self, flags: LifecycleFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Total payload size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Number of data chunks the payload is split into.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Whether the payload bytes are compressed.
    pub fn is_compressed(&self) -> bool {
        self.compressed || self.flags.contains(LifecycleFlags::GZIP)
    }

    /// Lifecycle flags.
    pub fn flags(&self) -> LifecycleFlags {
        self.flags
    }

    /// Backend modification timestamp.
    pub fn last_modified(&self) -> i64 {
        self.last_modified
    }

    /// Withdrawn blobs are never served.
    pub fn is_withdrawn(&self) -> bool {
        self.flags.contains(LifecycleFlags::WITHDRAWN)
    }

    /// Checks the record for internal consistency.
    pub fn validate(&self) -> StorageResult<()> {
        if self.size > 0 && self.chunk_count == 0 {
            return Err(StorageError::ProtocolViolation(format!(
                "blob of {} bytes has no chunks",
                self.size
            )));
        }
        if self.size > 0 && u64::from(self.chunk_count) > self.size {
            return Err(StorageError::ProtocolViolation(format!(
                "{} chunks cannot hold {} bytes",
                self.chunk_count, self.size
            )));
        }
        Ok(())
    }
}
