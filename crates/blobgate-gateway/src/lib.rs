#![warn(missing_docs)]

//! BlobGate gateway: races resolution strategies for one blob request,
//! deduplicates deliveries per client and writes exactly one outcome.

pub mod cancel;
pub mod config;
pub mod context;
pub mod counters;
pub mod dedup;
pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod getblob;
pub mod processor;
pub mod reply;
pub mod request;
pub mod resolution;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelRegistry, CancelToken};
pub use config::{CacheConfig, DedupConfig, GatewayConfig, ProcessorConfig};
pub use context::{GatewayServices, RequestScope};
pub use counters::{Counter, GatewayCounters};
pub use dedup::{AddOutcome, DeliveryDedupCache, DeliveryTicket, TicketState};
pub use dispatcher::Dispatcher;
pub use error::{ResolveError, Result, Severity};
pub use gateway::BlobGateway;
pub use getblob::{GetBlobFactory, GetBlobProcessor, LookupPlan};
pub use processor::{
    BlobProcessor, Priority, ProcessorFactory, ProcessorId, ProcessorRegistry, ProcessorState,
};
pub use reply::{
    FlushMode, MemoryReply, MemoryReplyReader, ReplyGate, ReplyItem, ReplySink, ReplyTranscript,
    SendStatus,
};
pub use request::{BlobRequest, RequestOutcome};
pub use resolution::{Claim, ResolutionEvent};
