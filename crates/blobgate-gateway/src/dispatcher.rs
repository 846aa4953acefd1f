//! Per-request dispatcher.
//!
//! One dispatcher runs one request on one task. It starts every eligible
//! processor in priority order, then polls them whenever the request's
//! waker fires until all of them are terminal, and finally writes the one
//! terminal outcome through the reply gate.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cancel::{CancelReason, CancelToken};
use crate::context::{GatewayServices, RequestScope};
use crate::counters::Counter;
use crate::error::ResolveError;
use crate::processor::{BlobProcessor, ProcessorRegistry, ProcessorState};
use crate::reply::ReplySink;
use crate::request::{BlobRequest, RequestOutcome};

/// Runs the processors of one request to a single terminal outcome.
pub struct Dispatcher {
    scope: RequestScope,
    processors: Vec<Box<dyn BlobProcessor>>,
}

impl Dispatcher {
    /// Instantiates every strategy in `registry` that accepts the request.
    pub fn new(
        request: BlobRequest,
        services: Arc<GatewayServices>,
        registry: &ProcessorRegistry,
        sink: Box<dyn ReplySink>,
    ) -> Self {
        let mut processors = registry.instantiate(&request, &services);
        processors.sort_by_key(|p| p.priority());
        let scope = RequestScope::new(request, services, sink);
        Self { scope, processors }
    }

    /// Number of processors instantiated for the request.
    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Drives the request to its single terminal outcome.
    pub async fn run(mut self, cancel: CancelToken) -> RequestOutcome {
        self.scope.counters().increment(Counter::Requests);
        let request_id = self.scope.request.request_id;
        let blob_id = self.scope.request.blob_id;
        info!(%request_id, blob = %blob_id, processors = self.processors.len(), "request started");

        if self.processors.is_empty() {
            warn!(%request_id, blob = %blob_id, "no eligible processor");
            self.scope
                .reply
                .record_failure(None, &ResolveError::NoProcessor { blob_id });
            return self.finish();
        }

        if let Some(reason) = cancel.cancelled_reason() {
            self.interrupt(reason);
            return self.finish();
        }

        self.start_all();

        let waker = self.scope.waker.clone();
        loop {
            self.poll_all();
            if self.all_terminal() {
                break;
            }
            tokio::select! {
                biased;
                reason = cancel.cancelled() => {
                    self.interrupt(reason);
                    break;
                }
                _ = waker.notified() => {}
            }
        }

        self.finish()
    }

    fn start_all(&mut self) {
        for processor in self.processors.iter_mut() {
            if self.scope.resolution.is_canceled_for(processor.id()) {
                debug!(processor = processor.name(), "request already resolved; not starting");
                processor.cancel(&mut self.scope);
            } else {
                processor.start(&mut self.scope);
            }
        }
    }

    fn poll_all(&mut self) {
        let mut need_wait = true;
        loop {
            for processor in self.processors.iter_mut() {
                if !processor.state().is_terminal() {
                    processor.process_event(&mut self.scope, need_wait);
                }
            }
            // Relieved backpressure may unblock a finalization.
            if self.scope.reply.pump() == 0 || self.all_terminal() {
                break;
            }
            need_wait = false;
        }
        self.scope.reply.flush();
    }

    fn all_terminal(&self) -> bool {
        self.processors.iter().all(|p| p.state().is_terminal())
    }

    fn winner_completed(&self) -> bool {
        let Some(winner) = self.scope.resolution.winner() else {
            return false;
        };
        self.processors
            .iter()
            .any(|p| p.id() == winner && p.state() == ProcessorState::Completed)
    }

    fn interrupt(&mut self, reason: CancelReason) {
        info!(request_id = %self.scope.request.request_id, %reason, "request interrupted");
        let winner_completed = self.winner_completed();
        self.scope.resolution.cancel_external(reason);
        for processor in self.processors.iter_mut() {
            processor.cancel(&mut self.scope);
        }
        if winner_completed {
            return;
        }
        let winner = self.scope.resolution.winner();
        self.scope
            .reply
            .record_failure(winner, &ResolveError::Interrupted(reason));
    }

    fn finish(mut self) -> RequestOutcome {
        let status = self.scope.reply.finish();
        let winner = self.scope.resolution.winner().and_then(|id| {
            self.processors
                .iter()
                .find(|p| p.id() == id)
                .map(|p| p.name().to_string())
        });
        let states = self
            .processors
            .iter()
            .map(|p| (p.name().to_string(), p.state()))
            .collect();
        let outcome = RequestOutcome {
            status,
            bytes_delivered: self.scope.reply.bytes_delivered(),
            winner,
            states,
        };
        info!(
            request_id = %self.scope.request.request_id,
            status,
            bytes = outcome.bytes_delivered,
            winner = outcome.winner.as_deref().unwrap_or("-"),
            "request finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::new_cancel_pair;
    use crate::config::{DedupConfig, ProcessorConfig};
    use crate::dedup::DeliveryDedupCache;
    use crate::reply::MemoryReply;
    use blobgate_storage::{
        BlobId, FetchKind, Fault, MemoryBackend, MemoryBackendConfig, MemoryMetadataCache,
    };
    use std::time::Duration;

    fn services(backend: Arc<MemoryBackend>) -> Arc<GatewayServices> {
        Arc::new(
            GatewayServices::new(
                [(4, "blob_ns4")].into_iter().collect(),
                Arc::new(MemoryMetadataCache::new(64, Duration::from_secs(60))),
                Arc::new(DeliveryDedupCache::new(&DedupConfig::default())),
            )
            .with_backend(backend),
        )
    }

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::from_config(&[
            ProcessorConfig::new("cache-tier", "cache", true, true, "memory"),
            ProcessorConfig::new("backend-direct", "backend", false, true, "memory"),
        ])
    }

    #[tokio::test]
    async fn test_run_streams_blob() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        let id = BlobId::new(4, 1);
        backend.insert("blob_ns4", id, &b"payload"[..], 1);
        let (sink, reader) = MemoryReply::new(1024);
        let dispatcher = Dispatcher::new(
            BlobRequest::new(id),
            services(backend),
            &registry(),
            Box::new(sink),
        );
        assert_eq!(dispatcher.processor_count(), 2);

        let outcome = dispatcher.run(CancelToken::detached()).await;
        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.bytes_delivered, 7);
        assert!(outcome.winner.is_some());
        let transcript = reader.read_to_end().await;
        assert_eq!(transcript.data, b"payload");
        assert_eq!(transcript.terminal_outcomes(), 1);
    }

    #[tokio::test]
    async fn test_same_group_waits_for_lock_holder() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        let id = BlobId::new(4, 3);
        backend.insert("blob_ns4", id, &b"locked"[..], 1);
        let registry = ProcessorRegistry::from_config(&[
            ProcessorConfig::new("first", "shared", false, true, "memory"),
            ProcessorConfig::new("second", "shared", false, true, "memory"),
        ]);
        let (sink, _reader) = MemoryReply::new(1024);
        let outcome = Dispatcher::new(BlobRequest::new(id), services(backend.clone()), &registry, Box::new(sink))
            .run(CancelToken::detached())
            .await;

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.winner.as_deref(), Some("first"));
        assert_eq!(outcome.state_of("second"), Some(ProcessorState::Canceled));
        assert_eq!(backend.stats().metadata_fetches, 1);
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_holder_fails() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        let id = BlobId::new(4, 4);
        backend.insert("blob_ns4", id, &b"second try"[..], 1);
        let registry = ProcessorRegistry::from_config(&[
            ProcessorConfig::new("cache-only", "shared", true, false, "memory"),
            ProcessorConfig::new("backend", "shared", false, true, "memory"),
        ]);
        let (sink, reader) = MemoryReply::new(1024);
        let outcome = Dispatcher::new(BlobRequest::new(id), services(backend), &registry, Box::new(sink))
            .run(CancelToken::detached())
            .await;

        assert_eq!(outcome.status, 200);
        assert_eq!(outcome.state_of("cache-only"), Some(ProcessorState::Error));
        assert_eq!(outcome.state_of("backend"), Some(ProcessorState::Completed));
        let transcript = reader.read_to_end().await;
        assert_eq!(transcript.data, b"second try");
        assert!(transcript.messages.is_empty());
    }

    #[tokio::test]
    async fn test_no_processor_is_404() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        backend.set_available(false);
        let (sink, reader) = MemoryReply::new(64);
        let outcome = Dispatcher::new(
            BlobRequest::new(BlobId::new(4, 1)),
            services(backend),
            &registry(),
            Box::new(sink),
        )
        .run(CancelToken::detached())
        .await;
        assert_eq!(outcome.status, 404);
        assert!(outcome.states.is_empty());
        let transcript = reader.read_to_end().await;
        assert!(transcript.messages[0].2.contains("no processor"));
    }

    #[tokio::test]
    async fn test_cancel_before_start_is_interrupted() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        let (token, handle) = new_cancel_pair();
        handle.cancel(CancelReason::ServerShutdown);
        let (sink, _reader) = MemoryReply::new(64);
        let outcome = Dispatcher::new(
            BlobRequest::new(BlobId::new(4, 1)),
            services(backend.clone()),
            &registry(),
            Box::new(sink),
        )
        .run(token)
        .await;
        assert_eq!(outcome.status, 503);
        assert_eq!(backend.stats().total_fetches(), 0);
        assert!(outcome
            .states
            .iter()
            .all(|(_, state)| *state == ProcessorState::Canceled));
    }

    #[tokio::test]
    async fn test_deadline_while_hanging() {
        let backend = Arc::new(MemoryBackend::new(MemoryBackendConfig::default()));
        let id = BlobId::new(4, 2);
        backend.inject_fault(FetchKind::Metadata, id, Fault::Hang);
        let (token, handle) = new_cancel_pair();
        let (sink, reader) = MemoryReply::new(64);
        let dispatcher = Dispatcher::new(
            BlobRequest::new(id),
            services(backend),
            &registry(),
            Box::new(sink),
        );
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            handle.cancel(CancelReason::DeadlineExceeded);
        });
        let outcome = dispatcher.run(token).await;
        assert_eq!(outcome.status, 504);
        let transcript = reader.read_to_end().await;
        assert_eq!(transcript.terminal_outcomes(), 1);
    }
}
