//! Shared harness for gateway integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use blobgate_gateway::dedup::ManualClock;
use blobgate_gateway::{
    BlobGateway, BlobRequest, DeliveryDedupCache, GatewayConfig, GatewayServices,
    ProcessorConfig, ReplyTranscript, RequestOutcome,
};
use blobgate_storage::{BlobId, BlobRecord, MemoryBackend, MemoryBackendConfig, MemoryMetadataCache};
use bytes::Bytes;

/// Default strategies over one in-memory backend with small chunks.
pub fn default_config(chunk_size: usize) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.backends[0].chunk_size = chunk_size;
    config
}

/// Cache tier on a slow backend racing a direct strategy on a fast one.
pub fn racing_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.backends = vec![
        MemoryBackendConfig {
            name: "slow".to_string(),
            metadata_latency_ms: 50,
            chunk_size: 4,
            ..Default::default()
        },
        MemoryBackendConfig {
            name: "fast".to_string(),
            chunk_size: 4,
            ..Default::default()
        },
    ];
    config.processors = vec![
        ProcessorConfig::new("cache-tier", "cache", true, true, "slow"),
        ProcessorConfig::new("backend-direct", "backend", false, true, "fast"),
    ];
    config
}

/// What one request produced.
pub struct Run {
    pub outcome: RequestOutcome,
    pub transcript: ReplyTranscript,
    pub writes_after_finish: usize,
}

/// Gateway over in-memory collaborators with a manual dedup clock.
pub struct Harness {
    pub gateway: BlobGateway,
    pub backends: HashMap<String, Arc<MemoryBackend>>,
    pub cache: Arc<MemoryMetadataCache>,
    pub clock: Arc<ManualClock>,
}

impl Harness {
    pub fn new(config: GatewayConfig) -> Self {
        let clock = Arc::new(ManualClock::new());
        let cache = Arc::new(MemoryMetadataCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let dedup = Arc::new(DeliveryDedupCache::with_clock(&config.dedup, clock.clone()));
        let mut services = GatewayServices::new(config.namespaces.clone(), cache.clone(), dedup);
        let mut backends = HashMap::new();
        for backend_config in &config.backends {
            let backend = Arc::new(MemoryBackend::new(backend_config.clone()));
            services = services.with_backend(backend.clone());
            backends.insert(backend_config.name.clone(), backend);
        }
        let gateway = BlobGateway::with_services(config, services).expect("test config is valid");
        Self {
            gateway,
            backends,
            cache,
            clock,
        }
    }

    pub fn backend(&self, name: &str) -> &Arc<MemoryBackend> {
        &self.backends[name]
    }

    /// Stores `payload` in every backend under the blob's namespace.
    pub fn store(&self, blob_id: BlobId, payload: &[u8], last_modified: i64) -> BlobRecord {
        let namespace = self
            .gateway
            .config()
            .namespaces
            .resolve(blob_id.storage_class)
            .expect("storage class is mapped")
            .to_string();
        let payload = Bytes::copy_from_slice(payload);
        let mut record = None;
        for backend in self.backends.values() {
            record = Some(backend.insert(&namespace, blob_id, payload.clone(), last_modified));
        }
        record.expect("at least one backend")
    }

    pub fn total_fetches(&self) -> u64 {
        self.backends.values().map(|b| b.stats().total_fetches()).sum()
    }

    /// Runs `request` while a client reads the reply concurrently.
    pub async fn run(&self, request: BlobRequest) -> Run {
        let (sink, reader) = self.gateway.reply();
        let (outcome, transcript) = tokio::join!(
            self.gateway.fetch(request, Box::new(sink)),
            reader.read_to_end()
        );
        Run {
            outcome,
            transcript,
            writes_after_finish: reader.writes_after_finish(),
        }
    }
}

/// Every request ends with exactly one terminal outcome.
pub fn assert_single_outcome(run: &Run) {
    assert!(run.transcript.finished, "reply never finished");
    assert_eq!(run.transcript.terminal_outcomes(), 1, "{:?}", run.transcript);
    assert_eq!(run.transcript.data_after_message, 0);
    assert_eq!(run.writes_after_finish, 0);
    if run.outcome.is_success() {
        assert!(run.transcript.messages.iter().all(|(status, _, _)| *status == 200));
    } else {
        assert_eq!(run.transcript.messages.len(), 1);
        assert_eq!(run.transcript.messages[0].0, run.outcome.status);
    }
}
