//! Shared gateway services and the per-request scope processors work in.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use blobgate_storage::{MetadataCache, NamespaceMap, StorageBackend};
use tokio::sync::Notify;
use tracing::debug;

use crate::counters::{Counter, GatewayCounters};
use crate::dedup::{AddOutcome, DeliveryDedupCache};
use crate::processor::ProcessorId;
use crate::reply::{ReplyGate, ReplySink};
use crate::request::BlobRequest;
use crate::resolution::{Claim, ResolutionEvent};

/// Process-wide collaborators shared by every request.
pub struct GatewayServices {
    /// Storage class to namespace mapping
    pub namespaces: NamespaceMap,
    /// Metadata cache tier
    pub cache: Arc<dyn MetadataCache>,
    /// Backends by name
    pub backends: HashMap<String, Arc<dyn StorageBackend>>,
    /// Delivery dedup cache
    pub dedup: Arc<DeliveryDedupCache>,
    /// Request and error counters
    pub counters: Arc<GatewayCounters>,
}

impl GatewayServices {
    /// Services without any backend; add them with [`GatewayServices::with_backend`].
    pub fn new(
        namespaces: NamespaceMap,
        cache: Arc<dyn MetadataCache>,
        dedup: Arc<DeliveryDedupCache>,
    ) -> Self {
        Self {
            namespaces,
            cache,
            backends: HashMap::new(),
            dedup,
            counters: Arc::new(GatewayCounters::new()),
        }
    }

    /// Registers a backend under its own name.
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    /// The backend registered as `name`.
    pub fn backend(&self, name: &str) -> Option<&Arc<dyn StorageBackend>> {
        self.backends.get(name)
    }
}

/// Everything the processors of one request share.
///
/// Owned by the dispatcher's task and handed to processors by `&mut`, so
/// no locking is needed inside a request.
pub struct RequestScope {
    /// The request being resolved
    pub request: BlobRequest,
    /// Process-wide collaborators
    pub services: Arc<GatewayServices>,
    /// Winner and group lock bookkeeping
    pub resolution: ResolutionEvent,
    /// The only path to the client
    pub reply: ReplyGate,
    /// Fired by fetch tasks, the reply sink and sibling state changes
    pub waker: Arc<Notify>,
    ticket: Option<AddOutcome>,
    ticket_holders: HashSet<ProcessorId>,
    ticket_completed: bool,
}

impl RequestScope {
    /// Scope for `request`, replying through `sink`.
    pub fn new(request: BlobRequest, services: Arc<GatewayServices>, sink: Box<dyn ReplySink>) -> Self {
        let waker = Arc::new(Notify::new());
        Self {
            request,
            services,
            resolution: ResolutionEvent::new(),
            reply: ReplyGate::new(sink, waker.clone()),
            waker,
            ticket: None,
            ticket_holders: HashSet::new(),
            ticket_completed: false,
        }
    }

    /// Shared counters.
    pub fn counters(&self) -> &GatewayCounters {
        &self.services.counters
    }

    /// Claims the win for `id`; the winner becomes the only reply writer.
    pub fn claim(&mut self, id: ProcessorId) -> Claim {
        let claim = self.resolution.claim(id);
        if claim == Claim::Won {
            self.reply.bind_writer(id);
        }
        self.waker.notify_one();
        claim
    }

    /// Releases `id`'s group lock; waiting siblings get polled again.
    pub fn unlock(&mut self, group: &str, id: ProcessorId) {
        if self.resolution.unlock(group, id) {
            self.waker.notify_one();
        }
    }

    /// Adds the request's delivery ticket once and shares the outcome.
    ///
    /// Returns `None` for requests without a client id.
    pub fn acquire_ticket(&mut self, id: ProcessorId) -> Option<AddOutcome> {
        let client_id = self.request.client_id.as_deref()?;
        let outcome = match self.ticket {
            Some(outcome) => outcome,
            None => {
                let outcome = self
                    .services
                    .dedup
                    .add_ticket(client_id, self.request.blob_id);
                let counter = match outcome {
                    AddOutcome::Added => Counter::DedupAdded,
                    AddOutcome::AlreadyInFlight => Counter::DedupInFlight,
                    AddOutcome::AlreadyCompleted => Counter::DedupCompleted,
                };
                self.services.counters.increment(counter);
                debug!(client = client_id, blob = %self.request.blob_id, ?outcome, "delivery ticket");
                self.ticket = Some(outcome);
                outcome
            }
        };
        if outcome == AddOutcome::Added {
            self.ticket_holders.insert(id);
        }
        Some(outcome)
    }

    /// Drops `id`'s interest in the ticket; the last holder to leave
    /// without a completed delivery removes the in-flight ticket.
    pub fn release_ticket(&mut self, id: ProcessorId) {
        if !self.ticket_holders.remove(&id) || !self.ticket_holders.is_empty() {
            return;
        }
        if self.ticket == Some(AddOutcome::Added) && !self.ticket_completed {
            if let Some(client_id) = self.request.client_id.as_deref() {
                self.services
                    .dedup
                    .remove_ticket(client_id, self.request.blob_id);
            }
            self.ticket = None;
        }
    }

    /// Records a finished delivery for the request's client. Only a request
    /// that added the ticket completes it.
    pub fn complete_ticket(&mut self) {
        if self.ticket != Some(AddOutcome::Added) {
            return;
        }
        if let Some(client_id) = self.request.client_id.as_deref() {
            self.services
                .dedup
                .complete_ticket(client_id, self.request.blob_id);
            self.ticket_completed = true;
        }
    }
}
