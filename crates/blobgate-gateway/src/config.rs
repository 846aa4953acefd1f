//! Gateway configuration

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use blobgate_storage::{MemoryBackendConfig, NamespaceMap};
use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, Result};

/// Delivery dedup cache sizing and expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Tickets held before a size purge kicks in
    pub max_size: usize,
    /// Share of `max_size` removed by a size purge, in percent
    pub purge_percentage: u32,
    /// Lifetime of a completed ticket, measured from completion
    pub ttl_secs: u64,
    /// Period of the background purge task
    pub purge_interval_secs: u64,
}

impl DedupConfig {
    /// Tickets removed by one size purge.
    pub fn purge_size(&self) -> usize {
        self.max_size * self.purge_percentage as usize / 100
    }

    /// Ticket lifetime.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Interval between purge passes.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            purge_percentage: 20,
            ttl_secs: 60,
            purge_interval_secs: 10,
        }
    }
}

/// Metadata cache tier sizing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept before the oldest are evicted
    pub max_entries: usize,
    /// Seconds an entry stays fresh
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            ttl_secs: 300,
        }
    }
}

/// One resolution strategy, in priority order within [`GatewayConfig::processors`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Strategy name used in logs and outcomes
    pub name: String,
    /// Strategies sharing a group never look the blob up concurrently
    pub group: String,
    /// Consult the metadata cache tier first
    pub consult_cache: bool,
    /// Fall back to backend metadata lookups
    pub use_backend: bool,
    /// Backend that serves metadata and bytes
    pub backend: String,
}

impl ProcessorConfig {
    /// Strategy `name` in `group`, fetching from `backend`.
    pub fn new(name: &str, group: &str, consult_cache: bool, use_backend: bool, backend: &str) -> Self {
        Self {
            name: name.to_string(),
            group: group.to_string(),
            consult_cache,
            use_backend,
            backend: backend.to_string(),
        }
    }
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// `tracing` filter directive used when `RUST_LOG` is unset
    pub log_level: String,
    /// Storage class to namespace mapping
    pub namespaces: NamespaceMap,
    /// Delivery dedup cache settings
    pub dedup: DedupConfig,
    /// Metadata cache settings
    pub cache: CacheConfig,
    /// In-memory backends to build
    pub backends: Vec<MemoryBackendConfig>,
    /// Strategies in priority order
    pub processors: Vec<ProcessorConfig>,
    /// Per-request deadline; none means requests only end on their own
    pub request_timeout_ms: Option<u64>,
    /// Bytes a reply buffers before reporting backpressure
    pub reply_capacity: usize,
}

impl GatewayConfig {
    /// Reads and validates a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: GatewayConfig = serde_json::from_str(&contents)
            .map_err(|e| ResolveError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// The per-request deadline, if one is configured.
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Rejects configurations the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.namespaces.is_empty() {
            return Err(ResolveError::Config(
                "at least one storage class namespace must be configured".to_string(),
            ));
        }

        if self.dedup.max_size == 0 {
            return Err(ResolveError::Config(
                "dedup max_size must be positive".to_string(),
            ));
        }

        if self.dedup.purge_percentage > 100 {
            return Err(ResolveError::Config(format!(
                "dedup purge_percentage {} exceeds 100",
                self.dedup.purge_percentage
            )));
        }

        if self.processors.is_empty() {
            return Err(ResolveError::Config(
                "at least one processor must be configured".to_string(),
            ));
        }

        if self.reply_capacity == 0 {
            return Err(ResolveError::Config(
                "reply_capacity must be positive".to_string(),
            ));
        }

        let backends: HashSet<&str> = self.backends.iter().map(|b| b.name.as_str()).collect();
        let mut names = HashSet::new();
        for processor in &self.processors {
            if !names.insert(processor.name.as_str()) {
                return Err(ResolveError::Config(format!(
                    "duplicate processor name {}",
                    processor.name
                )));
            }
            if !processor.consult_cache && !processor.use_backend {
                return Err(ResolveError::Config(format!(
                    "processor {} has no metadata source",
                    processor.name
                )));
            }
            if !backends.contains(processor.backend.as_str()) {
                return Err(ResolveError::Config(format!(
                    "processor {} refers to unknown backend {}",
                    processor.name, processor.backend
                )));
            }
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            namespaces: [(4, "blob_ns4"), (11, "blob_ns11")].into_iter().collect(),
            dedup: DedupConfig::default(),
            cache: CacheConfig::default(),
            backends: vec![MemoryBackendConfig::default()],
            processors: vec![
                ProcessorConfig::new("cache-tier", "cache", true, true, "memory"),
                ProcessorConfig::new("backend-direct", "backend", false, true, "memory"),
            ],
            request_timeout_ms: None,
            reply_capacity: 1024 * 1024,
        }
    }
}
