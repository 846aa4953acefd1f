//! Blob-by-id resolution strategy.
//!
//! A processor maps the blob's storage class to a namespace, takes the
//! request's delivery ticket, asks the metadata cache tier, falls back to a
//! backend metadata fetch and finally streams the payload from the backend.
//! Every step is driven from `process_event`; nothing here blocks.

use std::sync::Arc;

use blobgate_storage::{
    BlobIdentity, BlobRecord, CacheLookup, FetchEvent, FetchTask, StorageBackend, StorageError,
};
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProcessorConfig;
use crate::context::{GatewayServices, RequestScope};
use crate::counters::Counter;
use crate::dedup::AddOutcome;
use crate::error::ResolveError;
use crate::processor::{
    BlobProcessor, Priority, ProcessorFactory, ProcessorId, ProcessorState,
};
use crate::request::BlobRequest;
use crate::resolution::Claim;

/// Where a strategy looks for metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupPlan {
    /// Look the record up in the metadata cache first
    pub consult_cache: bool,
    /// Fall back to a backend metadata fetch when the cache cannot answer
    pub use_backend: bool,
}

impl From<&ProcessorConfig> for LookupPlan {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            consult_cache: config.consult_cache,
            use_backend: config.use_backend,
        }
    }
}

/// Factory for [`GetBlobProcessor`]s of one configured strategy.
pub struct GetBlobFactory {
    config: ProcessorConfig,
}

impl GetBlobFactory {
    /// Factory for the strategy described by `config`.
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }
}

impl ProcessorFactory for GetBlobFactory {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn can_handle(&self, request: &BlobRequest, services: &GatewayServices) -> bool {
        if !request.blob_id.is_valid() {
            return false;
        }
        if request.cache_only && !self.config.consult_cache {
            return false;
        }
        services
            .backend(&self.config.backend)
            .is_some_and(|backend| backend.is_available())
    }

    fn create(
        &self,
        id: ProcessorId,
        priority: Priority,
        request: &BlobRequest,
        services: &GatewayServices,
    ) -> Option<Box<dyn BlobProcessor>> {
        let backend = services.backend(&self.config.backend)?.clone();
        let mut processor = GetBlobProcessor::new(id, priority, &self.config, request, backend);
        processor.transition(ProcessorState::AwaitingAdmission);
        Some(Box::new(processor))
    }
}

/// Resolves one blob through the cache and one backend, then streams it.
pub struct GetBlobProcessor {
    id: ProcessorId,
    priority: Priority,
    name: String,
    group: String,
    plan: LookupPlan,
    backend: Arc<dyn StorageBackend>,
    identity: BlobIdentity,
    cache_only: bool,
    exclude_delivered: bool,
    state: ProcessorState,
    started: bool,
    in_process: bool,
    awaiting_lock: bool,
    record: Option<BlobRecord>,
    metadata_fetch: Option<FetchTask>,
    bytes_fetch: Option<FetchTask>,
    fetches_created: usize,
    bytes_sent: u64,
    failed: bool,
    excluded: bool,
}

impl GetBlobProcessor {
    /// A processor for `request` running the strategy in `config`.
    pub fn new(
        id: ProcessorId,
        priority: Priority,
        config: &ProcessorConfig,
        request: &BlobRequest,
        backend: Arc<dyn StorageBackend>,
    ) -> Self {
        Self {
            id,
            priority,
            name: config.name.clone(),
            group: config.group.clone(),
            plan: LookupPlan::from(config),
            backend,
            identity: request.identity(),
            cache_only: request.cache_only,
            exclude_delivered: request.exclude_delivered,
            state: ProcessorState::Created,
            started: false,
            in_process: false,
            awaiting_lock: false,
            record: None,
            metadata_fetch: None,
            bytes_fetch: None,
            fetches_created: 0,
            bytes_sent: 0,
            failed: false,
            excluded: false,
        }
    }

    /// Fetch tasks this processor issued.
    pub fn fetches_created(&self) -> usize {
        self.fetches_created
    }

    /// Payload bytes handed to the reply so far.
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    fn transition(&mut self, next: ProcessorState) -> bool {
        if !self.state.can_transition_to(next) {
            trace!(processor = %self.name, from = %self.state, to = %next, "transition ignored");
            return false;
        }
        debug!(processor = %self.name, from = %self.state, to = %next, "processor state");
        self.state = next;
        true
    }

    fn namespace(&self) -> &str {
        self.identity.namespace().unwrap_or_default()
    }

    fn begin_lookup(&mut self, scope: &mut RequestScope) {
        let blob_id = self.identity.blob_id();

        if let Some(outcome) = scope.acquire_ticket(self.id) {
            if outcome != AddOutcome::Added && self.exclude_delivered {
                self.exclude(scope, outcome);
                return;
            }
        }

        if self.plan.consult_cache {
            let lookup = scope.services.cache.lookup_blob_metadata(
                blob_id.storage_class,
                blob_id.local_key,
                self.identity.last_modified(),
            );
            match lookup {
                CacheLookup::Hit(record) => {
                    scope.counters().increment(Counter::CacheHit);
                    self.on_metadata(scope, record, true);
                    return;
                }
                CacheLookup::Miss => {
                    scope.counters().increment(Counter::CacheMiss);
                    if self.cache_only || !self.plan.use_backend {
                        self.fail(
                            scope,
                            ResolveError::NotFound {
                                blob_id,
                                reason: "blob properties are not found".to_string(),
                            },
                        );
                        return;
                    }
                }
                CacheLookup::Error(reason) => {
                    scope.counters().increment(Counter::CacheError);
                    warn!(processor = %self.name, blob = %blob_id, %reason, "metadata cache degraded");
                    if self.cache_only || !self.plan.use_backend {
                        self.fail(scope, ResolveError::CacheUnavailable { reason });
                        return;
                    }
                }
            }
        }

        let mut task =
            self.backend
                .fetch_metadata(self.namespace(), blob_id, self.identity.last_modified());
        task.set_data_ready(scope.waker.clone());
        self.fetches_created += 1;
        self.metadata_fetch = Some(task);
    }

    fn exclude(&mut self, scope: &mut RequestScope, outcome: AddOutcome) {
        match scope.claim(self.id) {
            Claim::Won => {
                let why = match outcome {
                    AddOutcome::AlreadyInFlight => "already being sent",
                    _ => "already sent",
                };
                scope.counters().increment(Counter::ExcludedBlobs);
                scope
                    .reply
                    .set_notice(self.id, format!("blob {} excluded: {}", self.identity.blob_id(), why));
                scope.unlock(&self.group, self.id);
                self.excluded = true;
            }
            Claim::Lost => self.cancel(scope),
        }
    }

    fn on_metadata(&mut self, scope: &mut RequestScope, record: BlobRecord, found: bool) {
        if scope.resolution.is_canceled_for(self.id) {
            return;
        }
        let blob_id = self.identity.blob_id();

        if !found || record.is_withdrawn() {
            let reason = if found {
                "blob is withdrawn"
            } else {
                "blob properties are not found"
            };
            self.fail(
                scope,
                ResolveError::NotFound {
                    blob_id,
                    reason: reason.to_string(),
                },
            );
            return;
        }

        if let Err(err) = record.validate() {
            self.fail(scope, err.into());
            return;
        }

        if scope.claim(self.id) == Claim::Lost {
            self.cancel(scope);
            return;
        }
        scope.counters().increment(Counter::Winners);
        info!(
            processor = %self.name,
            blob = %self.identity,
            size = record.size(),
            chunks = record.chunk_count(),
            "processor won"
        );
        scope.unlock(&self.group, self.id);

        if record.chunk_count() > 0 {
            let mut task = self.backend.fetch_bytes(self.namespace(), blob_id, &record);
            task.set_data_ready(scope.waker.clone());
            self.fetches_created += 1;
            self.bytes_fetch = Some(task);
        }
        self.record = Some(record);
    }

    fn on_chunk(&mut self, scope: &mut RequestScope, index: u32, data: Bytes) {
        if data.is_empty() {
            trace!(processor = %self.name, index, "end of data");
            return;
        }
        let len = data.len() as u64;
        if scope.reply.write(self.id, data) {
            self.bytes_sent += len;
            scope.counters().add(Counter::BytesSent, len);
        }
    }

    fn on_error(&mut self, scope: &mut RequestScope, err: StorageError) {
        if err.is_not_found() {
            debug!(processor = %self.name, blob = %self.identity, error = %err, "backend reports absence");
        } else {
            error!(processor = %self.name, blob = %self.identity, error = %err, "backend fetch failed");
        }
        self.fail(scope, err.into());
        scope.reply.flush();
    }

    fn fail(&mut self, scope: &mut RequestScope, err: ResolveError) {
        let counter = match &err {
            ResolveError::IdentityMapping { .. } => Counter::StorageClassMappingError,
            ResolveError::Transport(_) => Counter::TransportError,
            ResolveError::ProtocolViolation(_)
            | ResolveError::Storage(StorageError::ProtocolViolation(_)) => {
                Counter::ProtocolViolation
            }
            ResolveError::Storage(
                StorageError::Transport(_)
                | StorageError::Abandoned
                | StorageError::Unavailable { .. },
            ) => Counter::TransportError,
            e if e.is_not_found() => Counter::NotFound,
            _ => Counter::UnknownError,
        };
        scope.counters().increment(counter);
        scope.reply.record_failure(Some(self.id), &err);
        scope.unlock(&self.group, self.id);
        self.failed = true;
    }

    fn poll_metadata(&mut self, scope: &mut RequestScope, need_wait: bool) {
        let events = match self.metadata_fetch.as_mut() {
            Some(task) => take_events(task, need_wait),
            None => return,
        };
        for event in events {
            if self.state.is_terminal() || self.failed {
                break;
            }
            match event {
                FetchEvent::Metadata { record, found } => self.on_metadata(scope, record, found),
                FetchEvent::Error(err) => self.on_error(scope, err),
                FetchEvent::Chunk { .. } => {}
            }
        }
    }

    fn poll_bytes(&mut self, scope: &mut RequestScope, need_wait: bool) {
        let events = match self.bytes_fetch.as_mut() {
            Some(task) => take_events(task, need_wait),
            None => return,
        };
        for event in events {
            if self.state.is_terminal() || self.failed {
                break;
            }
            match event {
                FetchEvent::Chunk { index, data } => self.on_chunk(scope, index, data),
                FetchEvent::Error(err) => self.on_error(scope, err),
                FetchEvent::Metadata { .. } => {}
            }
        }
    }

    fn fetches_finished(&self) -> bool {
        self.metadata_fetch.as_ref().map_or(true, FetchTask::is_finished)
            && self.bytes_fetch.as_ref().map_or(true, FetchTask::is_finished)
    }

    fn is_done(&self, scope: &RequestScope) -> bool {
        if self.awaiting_lock || !self.fetches_finished() || scope.reply.has_pending_for(self.id) {
            return false;
        }
        self.failed || self.excluded || self.record.is_some()
    }

    fn finalize(&mut self, scope: &mut RequestScope) {
        scope.unlock(&self.group, self.id);
        if self.failed {
            scope.release_ticket(self.id);
            self.transition(ProcessorState::Error);
        } else {
            if !self.excluded {
                scope.complete_ticket();
            }
            scope.release_ticket(self.id);
            self.transition(ProcessorState::Completed);
        }
    }

    fn peek(&mut self, scope: &mut RequestScope, need_wait: bool) {
        if self.state.is_terminal() || !self.started {
            return;
        }
        if scope.resolution.is_canceled_for(self.id) {
            self.cancel(scope);
            return;
        }
        if self.awaiting_lock {
            if !scope.resolution.lock_group(&self.group, self.id) {
                return;
            }
            debug!(processor = %self.name, group = %self.group, "group lock acquired");
            self.awaiting_lock = false;
            self.begin_lookup(scope);
        }

        // A metadata answer can create the bytes fetch; poll again until no
        // new fetch appears.
        loop {
            let created = self.fetches_created;
            self.poll_metadata(scope, need_wait);
            self.poll_bytes(scope, need_wait);
            if self.state.is_terminal() || self.fetches_created == created {
                break;
            }
        }

        if !self.state.is_terminal() && self.is_done(scope) {
            self.finalize(scope);
        }
    }
}

/// Collects validated events; only `need_wait` pulls new ones off the channel.
fn take_events(task: &mut FetchTask, need_wait: bool) -> Vec<FetchEvent> {
    if need_wait {
        task.wait();
    }
    let mut events = Vec::new();
    while let Some(event) = task.next_event() {
        events.push(event);
    }
    events
}

impl BlobProcessor for GetBlobProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn group_name(&self) -> &str {
        &self.group
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn id(&self) -> ProcessorId {
        self.id
    }

    fn start(&mut self, scope: &mut RequestScope) {
        if self.started {
            return;
        }
        self.started = true;
        self.transition(ProcessorState::InProgress);

        let mapped = self
            .identity
            .resolve_namespace(&scope.services.namespaces)
            .map(|_| ());
        if let Err(err) = mapped {
            let blob_id = self.identity.blob_id();
            warn!(processor = %self.name, blob = %blob_id, error = %err, "storage class mapping failed");
            self.fail(
                scope,
                ResolveError::IdentityMapping {
                    blob_id,
                    storage_class: blob_id.storage_class,
                },
            );
            self.finalize(scope);
            return;
        }

        if !scope.resolution.lock_group(&self.group, self.id) {
            debug!(processor = %self.name, group = %self.group, "waiting for group lock");
            self.awaiting_lock = true;
            return;
        }
        self.begin_lookup(scope);
        self.peek(scope, true);
    }

    fn process_event(&mut self, scope: &mut RequestScope, need_wait: bool) {
        if self.in_process {
            return;
        }
        self.in_process = true;
        self.peek(scope, need_wait);
        self.in_process = false;
    }

    fn state(&self) -> ProcessorState {
        self.state
    }

    fn cancel(&mut self, scope: &mut RequestScope) {
        if self.state.is_terminal() {
            return;
        }
        for task in [self.metadata_fetch.as_mut(), self.bytes_fetch.as_mut()]
            .into_iter()
            .flatten()
        {
            if !task.is_finished() {
                task.cancel();
            }
        }
        let dropped = scope.reply.discard_from(self.id);
        scope.release_ticket(self.id);
        scope.unlock(&self.group, self.id);
        if self.transition(ProcessorState::Canceled) {
            scope.counters().increment(Counter::CanceledProcessors);
            debug!(processor = %self.name, bytes_sent = self.bytes_sent, dropped, "processor canceled");
        }
    }

    fn is_busy(&self) -> bool {
        self.in_process || !self.fetches_finished()
    }
}
