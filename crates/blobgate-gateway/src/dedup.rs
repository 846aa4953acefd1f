//! Delivery dedup cache: at most one in-flight delivery per (client, blob).
//!
//! Tickets live in a sharded map so concurrent requests only contend when
//! they hash to the same shard. Completed tickets expire a fixed time after
//! completion; lookups never extend that lifetime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use blobgate_storage::BlobId;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::config::DedupConfig;

/// Time source for ticket expiry.
pub trait DedupClock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;
}

/// Wall clock.
#[derive(Debug, Default)]
pub struct SystemClock;

impl DedupClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    /// A clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupClock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }
}

/// Result of [`DeliveryDedupCache::add_ticket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new in-flight ticket was created
    Added,
    /// The client already received the blob within the TTL
    AlreadyCompleted,
    /// Another request is delivering the blob to the client right now
    AlreadyInFlight,
}

/// Delivery state of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketState {
    /// Some request is streaming the blob
    InFlight,
    /// The blob was delivered
    Completed,
}

/// Per client and blob delivery record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryTicket {
    /// Client the blob goes to
    pub client_id: String,
    /// The delivered blob
    pub blob_id: BlobId,
    /// Where the delivery stands
    pub state: TicketState,
    /// When the delivery finished
    pub completed_at: Option<Instant>,
}

impl DeliveryTicket {
    fn in_flight(client_id: &str, blob_id: BlobId) -> Self {
        Self {
            client_id: client_id.to_string(),
            blob_id,
            state: TicketState::InFlight,
            completed_at: None,
        }
    }

    fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        match (self.state, self.completed_at) {
            (TicketState::Completed, Some(at)) => now.saturating_duration_since(at) >= ttl,
            _ => false,
        }
    }
}

type TicketKey = (String, BlobId);

/// Shared tracker of deliveries, created at startup and drained at shutdown.
pub struct DeliveryDedupCache {
    tickets: DashMap<TicketKey, DeliveryTicket>,
    ttl: Duration,
    max_size: usize,
    purge_size: usize,
    clock: Arc<dyn DedupClock>,
}

impl DeliveryDedupCache {
    /// Cache on the wall clock.
    pub fn new(config: &DedupConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Cache on a caller-supplied clock.
    pub fn with_clock(config: &DedupConfig, clock: Arc<dyn DedupClock>) -> Self {
        Self {
            tickets: DashMap::new(),
            ttl: config.ttl(),
            max_size: config.max_size,
            purge_size: config.purge_size(),
            clock,
        }
    }

    /// Atomically adds an in-flight ticket or reports the existing one.
    pub fn add_ticket(&self, client_id: &str, blob_id: BlobId) -> AddOutcome {
        let now = self.clock.now();
        match self.tickets.entry((client_id.to_string(), blob_id)) {
            Entry::Occupied(mut entry) => match entry.get().state {
                TicketState::InFlight => AddOutcome::AlreadyInFlight,
                TicketState::Completed if entry.get().is_expired(now, self.ttl) => {
                    entry.insert(DeliveryTicket::in_flight(client_id, blob_id));
                    AddOutcome::Added
                }
                TicketState::Completed => AddOutcome::AlreadyCompleted,
            },
            Entry::Vacant(entry) => {
                entry.insert(DeliveryTicket::in_flight(client_id, blob_id));
                AddOutcome::Added
            }
        }
    }

    /// Marks the delivery completed now, creating the ticket if needed.
    pub fn complete_ticket(&self, client_id: &str, blob_id: BlobId) {
        let now = self.clock.now();
        let mut ticket = self
            .tickets
            .entry((client_id.to_string(), blob_id))
            .or_insert_with(|| DeliveryTicket::in_flight(client_id, blob_id));
        ticket.state = TicketState::Completed;
        ticket.completed_at = Some(now);
    }

    /// Drops an in-flight ticket; completed tickets are kept.
    pub fn remove_ticket(&self, client_id: &str, blob_id: BlobId) -> bool {
        self.tickets
            .remove_if(&(client_id.to_string(), blob_id), |_, ticket| {
                ticket.state == TicketState::InFlight
            })
            .is_some()
    }

    /// Snapshot of the ticket for `client_id` and `blob_id`.
    pub fn ticket(&self, client_id: &str, blob_id: BlobId) -> Option<DeliveryTicket> {
        self.tickets
            .get(&(client_id.to_string(), blob_id))
            .map(|t| t.value().clone())
    }

    /// Drops expired tickets, then trims oldest completed ones when oversized.
    pub fn purge(&self) -> usize {
        let now = self.clock.now();
        let before = self.tickets.len();
        self.tickets.retain(|_, ticket| !ticket.is_expired(now, self.ttl));

        if self.tickets.len() > self.max_size {
            let target = self.max_size - self.purge_size;
            let mut completed: Vec<(Instant, TicketKey)> = self
                .tickets
                .iter()
                .filter_map(|t| t.completed_at.map(|at| (at, t.key().clone())))
                .collect();
            completed.sort_by_key(|(at, _)| *at);

            for (_, key) in completed {
                if self.tickets.len() <= target {
                    break;
                }
                self.tickets
                    .remove_if(&key, |_, t| t.state == TicketState::Completed);
            }
        }

        let removed = before.saturating_sub(self.tickets.len());
        if removed > 0 {
            debug!(removed, remaining = self.tickets.len(), "dedup cache purged");
        }
        removed
    }

    /// Purges every `interval` until `token` is cancelled.
    pub fn spawn_purger(self: &Arc<Self>, interval: Duration, token: CancelToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        cache.purge();
                    }
                    reason = token.cancelled() => {
                        debug!(%reason, "dedup purger stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Clears every ticket at shutdown and returns how many were held.
    pub fn drain(&self) -> usize {
        let count = self.tickets.len();
        self.tickets.clear();
        info!(count, "dedup cache drained");
        count
    }

    /// Number of tickets held.
    pub fn len(&self) -> usize {
        self.tickets.len()
    }

    /// True when no ticket is held.
    pub fn is_empty(&self) -> bool {
        self.tickets.is_empty()
    }

    /// Number of in-flight tickets.
    pub fn in_flight(&self) -> usize {
        self.tickets
            .iter()
            .filter(|t| t.state == TicketState::InFlight)
            .count()
    }
}
