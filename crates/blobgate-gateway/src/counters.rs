//! Gateway counters

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Every counter the resolution engine bumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Requests admitted by the dispatcher
    Requests,
    /// Storage class could not be mapped to a namespace
    StorageClassMappingError,
    /// Metadata cache hits
    CacheHit,
    /// Metadata cache misses
    CacheMiss,
    /// Metadata cache lookup failures (absorbed)
    CacheError,
    /// Blobs reported as not found
    NotFound,
    /// Failures not classified elsewhere
    UnknownError,
    /// Backend transport failures
    TransportError,
    /// Malformed backend data
    ProtocolViolation,
    /// Processors that won their request
    Winners,
    /// Processors canceled by a sibling or by the client
    CanceledProcessors,
    /// Requests answered with "blob excluded"
    ExcludedBlobs,
    /// Delivery tickets added
    DedupAdded,
    /// Ticket additions that found an in-flight delivery
    DedupInFlight,
    /// Ticket additions that found a completed delivery
    DedupCompleted,
    /// Payload bytes accepted by reply sinks
    BytesSent,
}

impl Counter {
    /// All counters in export order.
    pub const ALL: [Counter; 16] = [
        Counter::Requests,
        Counter::StorageClassMappingError,
        Counter::CacheHit,
        Counter::CacheMiss,
        Counter::CacheError,
        Counter::NotFound,
        Counter::UnknownError,
        Counter::TransportError,
        Counter::ProtocolViolation,
        Counter::Winners,
        Counter::CanceledProcessors,
        Counter::ExcludedBlobs,
        Counter::DedupAdded,
        Counter::DedupInFlight,
        Counter::DedupCompleted,
        Counter::BytesSent,
    ];

    /// Metric name without prefix.
    pub fn name(&self) -> &'static str {
        match self {
            Counter::Requests => "requests",
            Counter::StorageClassMappingError => "storage_class_mapping_errors",
            Counter::CacheHit => "cache_hits",
            Counter::CacheMiss => "cache_misses",
            Counter::CacheError => "cache_errors",
            Counter::NotFound => "not_found",
            Counter::UnknownError => "unknown_errors",
            Counter::TransportError => "transport_errors",
            Counter::ProtocolViolation => "protocol_violations",
            Counter::Winners => "winners",
            Counter::CanceledProcessors => "canceled_processors",
            Counter::ExcludedBlobs => "excluded_blobs",
            Counter::DedupAdded => "dedup_added",
            Counter::DedupInFlight => "dedup_in_flight",
            Counter::DedupCompleted => "dedup_completed",
            Counter::BytesSent => "bytes_sent",
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

/// Fire-and-forget gateway counters. Never blocks, never fails.
pub struct GatewayCounters {
    values: [AtomicU64; Counter::ALL.len()],
    uptime_start: Instant,
}

impl GatewayCounters {
    /// All counters at zero.
    pub fn new() -> Self {
        Self {
            values: std::array::from_fn(|_| AtomicU64::new(0)),
            uptime_start: Instant::now(),
        }
    }

    /// Adds one to `counter`.
    pub fn increment(&self, counter: Counter) {
        self.add(counter, 1);
    }

    /// Adds `amount` to `counter`.
    pub fn add(&self, counter: Counter, amount: u64) {
        self.values[counter.slot()].fetch_add(amount, Ordering::Relaxed);
    }

    /// Current value of `counter`.
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.slot()].load(Ordering::Relaxed)
    }

    /// Current value of every counter, in export order.
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::ALL.iter().map(|c| (*c, self.get(*c))).collect()
    }

    /// Seconds since the counters were created.
    pub fn uptime_secs(&self) -> u64 {
        self.uptime_start.elapsed().as_secs()
    }

    /// Cache hits over cache lookups, 0.0 before the first lookup.
    pub fn cache_hit_rate(&self) -> f64 {
        let hits = self.get(Counter::CacheHit);
        let total = hits + self.get(Counter::CacheMiss) + self.get(Counter::CacheError);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    /// Renders every counter in the Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        for (counter, value) in self.snapshot() {
            let name = format!("bg_gateway_{}_total", counter.name());
            output.push_str(&format!("# TYPE {} counter\n", name));
            output.push_str(&format!("{} {}\n", name, value));
        }
        output.push_str("# TYPE bg_gateway_uptime_seconds gauge\n");
        output.push_str(&format!("bg_gateway_uptime_seconds {}\n", self.uptime_secs()));
        output
    }
}

impl Default for GatewayCounters {
    fn default() -> Self {
        Self::new()
    }
}
