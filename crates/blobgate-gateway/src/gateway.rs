//! Gateway facade: owns the shared services and runs requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use blobgate_storage::{MemoryBackend, MemoryMetadataCache};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelRegistry};
use crate::config::GatewayConfig;
use crate::context::GatewayServices;
use crate::counters::GatewayCounters;
use crate::dedup::DeliveryDedupCache;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::processor::ProcessorRegistry;
use crate::reply::{MemoryReply, MemoryReplyReader, ReplySink};
use crate::request::{BlobRequest, RequestOutcome};

/// Blob gateway with its configured strategies and collaborators.
pub struct BlobGateway {
    config: GatewayConfig,
    services: Arc<GatewayServices>,
    registry: ProcessorRegistry,
    cancels: CancelRegistry,
    memory_backends: HashMap<String, Arc<MemoryBackend>>,
    memory_cache: Option<Arc<MemoryMetadataCache>>,
    purger: Mutex<Option<(JoinHandle<()>, CancelHandle)>>,
    shutting_down: AtomicBool,
    /// Fired whenever a request leaves the cancel registry
    idle: Notify,
}

/// Deregisters a running request even if its future is dropped.
struct ActiveRequest<'a> {
    gateway: &'a BlobGateway,
    request_id: Uuid,
    deadline: Option<JoinHandle<()>>,
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        if let Some(task) = self.deadline.take() {
            task.abort();
        }
        self.gateway.cancels.remove(self.request_id);
        self.gateway.idle.notify_waiters();
    }
}

impl BlobGateway {
    /// Builds a gateway over in-memory cache and backends from `config`.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;
        let cache = Arc::new(MemoryMetadataCache::new(
            config.cache.max_entries,
            Duration::from_secs(config.cache.ttl_secs),
        ));
        let dedup = Arc::new(DeliveryDedupCache::new(&config.dedup));
        let mut services = GatewayServices::new(config.namespaces.clone(), cache.clone(), dedup);
        let mut memory_backends = HashMap::new();
        for backend_config in &config.backends {
            let backend = Arc::new(MemoryBackend::new(backend_config.clone()));
            services = services.with_backend(backend.clone());
            memory_backends.insert(backend_config.name.clone(), backend);
        }

        let mut gateway = Self::with_services(config, services)?;
        gateway.memory_backends = memory_backends;
        gateway.memory_cache = Some(cache);
        Ok(gateway)
    }

    /// Builds a gateway over caller-supplied collaborators.
    pub fn with_services(config: GatewayConfig, services: GatewayServices) -> Result<Self> {
        config.validate()?;
        let registry = ProcessorRegistry::from_config(&config.processors);
        info!(
            processors = ?registry.names(),
            namespaces = config.namespaces.len(),
            backends = services.backends.len(),
            "gateway configured"
        );
        Ok(Self {
            config,
            services: Arc::new(services),
            registry,
            cancels: CancelRegistry::new(),
            memory_backends: HashMap::new(),
            memory_cache: None,
            purger: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            idle: Notify::new(),
        })
    }

    /// The configuration the gateway was built from.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Collaborators shared by every request.
    pub fn services(&self) -> &Arc<GatewayServices> {
        &self.services
    }

    /// Request and error counters.
    pub fn counters(&self) -> &GatewayCounters {
        &self.services.counters
    }

    /// Configured strategies.
    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// The in-memory backend registered under `name`, when built by [`BlobGateway::new`].
    pub fn memory_backend(&self, name: &str) -> Option<Arc<MemoryBackend>> {
        self.memory_backends.get(name).cloned()
    }

    /// The in-memory metadata cache, when built by [`BlobGateway::new`].
    pub fn memory_cache(&self) -> Option<Arc<MemoryMetadataCache>> {
        self.memory_cache.clone()
    }

    /// A reply sized by the configured capacity.
    pub fn reply(&self) -> (MemoryReply, MemoryReplyReader) {
        MemoryReply::new(self.config.reply_capacity)
    }

    /// Starts the dedup purge task. Calling it twice is a no-op.
    pub fn start(&self) {
        let mut purger = self.purger.lock();
        if purger.is_some() {
            return;
        }
        let (token, handle) = new_cancel_pair();
        let interval = self.config.dedup.purge_interval();
        let task = self.services.dedup.spawn_purger(interval, token);
        *purger = Some((task, handle));
        info!(interval_secs = interval.as_secs(), "dedup purger started");
    }

    /// Runs one request to its terminal outcome.
    pub async fn fetch(&self, request: BlobRequest, sink: Box<dyn ReplySink>) -> RequestOutcome {
        let request_id = request.request_id;
        let (token, handle) = self.cancels.register(request_id);
        if self.shutting_down.load(Ordering::SeqCst) {
            handle.cancel(CancelReason::ServerShutdown);
        }

        let deadline = self.config.request_timeout().map(|timeout| {
            let handle = handle.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                debug!(%request_id, "request deadline reached");
                handle.cancel(CancelReason::DeadlineExceeded);
            })
        });

        let _active = ActiveRequest {
            gateway: self,
            request_id,
            deadline,
        };

        let dispatcher = Dispatcher::new(request, self.services.clone(), &self.registry, sink);
        dispatcher.run(token).await
    }

    /// Cancels an in-flight request; false if it is not running.
    pub fn cancel(&self, request_id: Uuid, reason: CancelReason) -> bool {
        self.cancels.cancel(request_id, reason)
    }

    /// Number of requests currently running.
    pub fn active_requests(&self) -> usize {
        self.cancels.active_count()
    }

    /// Cancels in-flight requests and waits for them to wind down, then
    /// stops the purger and drains the dedup cache. Returns the number of
    /// requests canceled.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        let canceled = self.cancels.cancel_all(CancelReason::ServerShutdown);
        loop {
            let idle = self.idle.notified();
            let active = self.active_requests();
            if active == 0 {
                break;
            }
            debug!(active, "waiting for canceled requests to finish");
            idle.await;
        }

        let purger = self.purger.lock().take();
        if let Some((task, handle)) = purger {
            handle.cancel(CancelReason::ServerShutdown);
            if let Err(e) = task.await {
                warn!(error = %e, "dedup purger ended abnormally");
            }
        }

        let drained = self.services.dedup.drain();
        info!(canceled, drained, "gateway stopped");
        canceled
    }
}
