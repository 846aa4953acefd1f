//! Storage backend interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StorageError;
use crate::fetch::{FetchKind, FetchSender, FetchTask};
use crate::identity::BlobId;
use crate::record::BlobRecord;

/// Durable, asynchronous source of blob metadata and payload bytes.
///
/// Both fetch methods return immediately; results arrive through the
/// returned [`FetchTask`]. Implementations must be called from within a
/// tokio runtime.
pub trait StorageBackend: Send + Sync {
    /// Backend name used in logs and processor routing.
    fn name(&self) -> &str;

    /// Whether the backend currently accepts requests.
    fn is_available(&self) -> bool;

    /// Starts a metadata lookup.
    fn fetch_metadata(
        &self,
        namespace: &str,
        blob_id: BlobId,
        last_modified: Option<i64>,
    ) -> FetchTask;

    /// Starts streaming the payload described by `record`.
    fn fetch_bytes(&self, namespace: &str, blob_id: BlobId, record: &BlobRecord) -> FetchTask;
}

/// Failure a [`MemoryBackend`] can be told to produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Fail with a transport error carrying this message
    Transport(String),
    /// Report the blob as missing
    NotFound,
    /// Skip a chunk index after the first chunk
    OutOfOrder,
    /// Drop the fetch without a terminal event
    Abandon,
    /// Never answer until the consumer cancels
    Hang,
}

/// Tunables for [`MemoryBackend`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryBackendConfig {
    /// Backend name
    pub name: String,
    /// Delay before a metadata answer, in milliseconds
    pub metadata_latency_ms: u64,
    /// Delay between chunks, in milliseconds
    pub chunk_latency_ms: u64,
    /// Payload bytes per chunk when inserting blobs
    pub chunk_size: usize,
}

impl Default for MemoryBackendConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            metadata_latency_ms: 0,
            chunk_latency_ms: 0,
            chunk_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    record: BlobRecord,
    payload: Bytes,
}

/// Counters of fetches issued against a [`MemoryBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Metadata fetches started
    pub metadata_fetches: u64,
    /// Bytes fetches started
    pub bytes_fetches: u64,
    /// Fetches stopped because the consumer went away
    pub abandoned_by_consumer: u64,
}

impl BackendStats {
    /// Total fetches of either kind.
    pub fn total_fetches(&self) -> u64 {
        self.metadata_fetches + self.bytes_fetches
    }
}

#[derive(Default)]
struct StatCounters {
    metadata_fetches: AtomicU64,
    bytes_fetches: AtomicU64,
    abandoned_by_consumer: AtomicU64,
}

/// In-memory backend driven by tokio tasks.
pub struct MemoryBackend {
    config: MemoryBackendConfig,
    blobs: RwLock<HashMap<(String, i32), StoredBlob>>,
    faults: Mutex<HashMap<(FetchKind, BlobId), Fault>>,
    available: AtomicBool,
    stats: std::sync::Arc<StatCounters>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new(config: MemoryBackendConfig) -> Self {
        Self {
            config,
            blobs: RwLock::new(HashMap::new()),
            faults: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            stats: std::sync::Arc::new(StatCounters::default()),
        }
    }

    /// Stores a payload, splitting it into chunks of the configured size.
    pub fn insert(
        &self,
        namespace: &str,
        blob_id: BlobId,
        payload: impl Into<Bytes>,
        last_modified: i64,
    ) -> BlobRecord {
        let payload = payload.into();
        let chunk_size = self.config.chunk_size.max(1);
        let chunk_count = payload.len().div_ceil(chunk_size) as u32;
        let record = BlobRecord::new(payload.len() as u64, chunk_count, last_modified);
        self.insert_record(namespace, blob_id, record.clone(), payload);
        record
    }

    /// Stores an explicit record and payload (the record is not checked).
    pub fn insert_record(
        &self,
        namespace: &str,
        blob_id: BlobId,
        record: BlobRecord,
        payload: impl Into<Bytes>,
    ) {
        self.blobs.write().insert(
            (namespace.to_string(), blob_id.local_key),
            StoredBlob {
                record,
                payload: payload.into(),
            },
        );
    }

    /// Makes the next fetches of `kind` for `blob_id` fail with `fault`.
    pub fn inject_fault(&self, kind: FetchKind, blob_id: BlobId, fault: Fault) {
        self.faults.lock().insert((kind, blob_id), fault);
    }

    /// Removes every injected fault.
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Marks the backend (un)available.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Snapshot of fetch counters.
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            metadata_fetches: self.stats.metadata_fetches.load(Ordering::Relaxed),
            bytes_fetches: self.stats.bytes_fetches.load(Ordering::Relaxed),
            abandoned_by_consumer: self.stats.abandoned_by_consumer.load(Ordering::Relaxed),
        }
    }

    fn lookup(&self, namespace: &str, blob_id: BlobId) -> Option<StoredBlob> {
        self.blobs
            .read()
            .get(&(namespace.to_string(), blob_id.local_key))
            .cloned()
    }

    fn fault(&self, kind: FetchKind, blob_id: BlobId) -> Option<Fault> {
        self.faults.lock().get(&(kind, blob_id)).cloned()
    }
}

impl StorageBackend for MemoryBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn fetch_metadata(
        &self,
        namespace: &str,
        blob_id: BlobId,
        last_modified: Option<i64>,
    ) -> FetchTask {
        self.stats.metadata_fetches.fetch_add(1, Ordering::Relaxed);
        let (tx, task) = FetchTask::channel(
            FetchKind::Metadata,
            format!("{} metadata {}@{}", self.config.name, blob_id, namespace),
        );

        let stored = self.lookup(namespace, blob_id);
        let fault = self.fault(FetchKind::Metadata, blob_id);
        let latency = Duration::from_millis(self.config.metadata_latency_ms);
        let namespace = namespace.to_string();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            pause(latency).await;
            if let Some(fault) = fault {
                deliver_fault(&tx, fault, &namespace, blob_id, &stats).await;
                return;
            }
            let found = stored
                .filter(|blob| last_modified.map_or(true, |lm| lm == blob.record.last_modified()));
            let sent = match found {
                Some(blob) => tx.metadata(blob.record, true),
                None => tx.metadata(BlobRecord::new(0, 0, 0), false),
            };
            if !sent {
                stats.abandoned_by_consumer.fetch_add(1, Ordering::Relaxed);
            }
        });

        task
    }

    fn fetch_bytes(&self, namespace: &str, blob_id: BlobId, record: &BlobRecord) -> FetchTask {
        self.stats.bytes_fetches.fetch_add(1, Ordering::Relaxed);
        let (tx, task) = FetchTask::channel(
            FetchKind::Bytes,
            format!("{} bytes {}@{}", self.config.name, blob_id, namespace),
        );

        let stored = self.lookup(namespace, blob_id);
        let fault = self.fault(FetchKind::Bytes, blob_id);
        let latency = Duration::from_millis(self.config.chunk_latency_ms);
        let chunk_count = record.chunk_count();
        let namespace = namespace.to_string();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let Some(blob) = stored else {
                tx.error(StorageError::NotFound {
                    namespace,
                    blob_id,
                });
                return;
            };
            let chunks = split_payload(&blob.payload, chunk_count);
            let mut fault = fault;
            let mut next_index = 0u32;
            for (position, chunk) in chunks.into_iter().enumerate() {
                pause(latency).await;
                if position == 1 {
                    match fault.take() {
                        Some(Fault::OutOfOrder) => next_index += 1,
                        Some(other) => {
                            deliver_fault(&tx, other, &namespace, blob_id, &stats).await;
                            return;
                        }
                        None => {}
                    }
                }
                if !tx.chunk(next_index, chunk) {
                    stats.abandoned_by_consumer.fetch_add(1, Ordering::Relaxed);
                    debug!(%blob_id, "bytes fetch stopped: consumer closed");
                    return;
                }
                next_index += 1;
            }
            if let Some(fault) = fault {
                deliver_fault(&tx, fault, &namespace, blob_id, &stats).await;
                return;
            }
            pause(latency).await;
            tx.end(next_index);
        });

        task
    }
}

async fn pause(latency: Duration) {
    if latency.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(latency).await;
    }
}

async fn deliver_fault(
    tx: &FetchSender,
    fault: Fault,
    namespace: &str,
    blob_id: BlobId,
    stats: &StatCounters,
) {
    match fault {
        Fault::Transport(message) => {
            warn!(%blob_id, %message, "injected transport fault");
            tx.error(StorageError::Transport(message));
        }
        Fault::NotFound => {
            tx.error(StorageError::NotFound {
                namespace: namespace.to_string(),
                blob_id,
            });
        }
        Fault::OutOfOrder => {
            tx.chunk(u32::MAX, Bytes::from_static(b"?"));
        }
        Fault::Abandon => {}
        Fault::Hang => {
            while !tx.is_closed() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stats.abandoned_by_consumer.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn split_payload(payload: &Bytes, chunk_count: u32) -> Vec<Bytes> {
    if payload.is_empty() || chunk_count == 0 {
        return Vec::new();
    }
    let per_chunk = payload.len().div_ceil(chunk_count as usize);
    let mut chunks = Vec::with_capacity(chunk_count as usize);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + per_chunk).min(payload.len());
        chunks.push(payload.slice(offset..end));
        offset = end;
    }
    chunks
}
