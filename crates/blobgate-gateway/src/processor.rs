//! Resolution strategies and their priority-ordered registry.

use std::sync::Arc;

use tracing::debug;

use crate::config::{GatewayConfig, ProcessorConfig};
use crate::context::{GatewayServices, RequestScope};
use crate::getblob::GetBlobFactory;
use crate::request::BlobRequest;

/// Position of a processor within its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessorId(pub usize);

/// Tie-break rank; lower wins.
pub type Priority = u32;

/// Processor lifecycle. `Completed`, `Canceled` and `Error` are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessorState {
    /// Instantiated, not yet admitted
    Created,
    /// Admitted, waiting to be started
    AwaitingAdmission,
    /// Started and resolving
    InProgress,
    /// Resolved; the blob or a notice went out
    Completed,
    /// Stopped because another processor won or the request ended
    Canceled,
    /// Failed
    Error,
}

impl ProcessorState {
    /// True for `Completed`, `Canceled` and `Error`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessorState::Completed | ProcessorState::Canceled | ProcessorState::Error
        )
    }

    /// Allowed edges of the lifecycle.
    pub fn can_transition_to(self, next: ProcessorState) -> bool {
        use ProcessorState::*;
        if self.is_terminal() {
            return false;
        }
        match next {
            Created => false,
            AwaitingAdmission => self == Created,
            InProgress => self == AwaitingAdmission,
            Completed | Error => self == InProgress,
            Canceled => matches!(self, AwaitingAdmission | InProgress),
        }
    }
}

impl std::fmt::Display for ProcessorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ProcessorState::Created => "created",
            ProcessorState::AwaitingAdmission => "awaiting-admission",
            ProcessorState::InProgress => "in-progress",
            ProcessorState::Completed => "completed",
            ProcessorState::Canceled => "canceled",
            ProcessorState::Error => "error",
        };
        f.write_str(text)
    }
}

/// One resolution strategy for one request, polled by the dispatcher.
pub trait BlobProcessor: Send {
    /// Strategy name.
    fn name(&self) -> &str;
    /// Group sharing one lock.
    fn group_name(&self) -> &str;
    /// Tie-break rank.
    fn priority(&self) -> Priority;
    /// Id within the request.
    fn id(&self) -> ProcessorId;
    /// Begins resolution. Calling it again is a no-op.
    fn start(&mut self, scope: &mut RequestScope);
    /// Advances the processor and finalizes it once done; `need_wait` also
    /// pulls newly arrived fetch events.
    fn process_event(&mut self, scope: &mut RequestScope, need_wait: bool);
    /// Current lifecycle state.
    fn state(&self) -> ProcessorState;
    /// Stops the processor, closing its fetches and discarding its bytes.
    fn cancel(&mut self, scope: &mut RequestScope);
    /// True while fetches are outstanding or an event is being processed.
    fn is_busy(&self) -> bool;
}

/// Builds processors of one strategy.
pub trait ProcessorFactory: Send + Sync {
    /// Strategy name.
    fn name(&self) -> &str;
    /// Pure check of request shape and collaborator availability.
    fn can_handle(&self, request: &BlobRequest, services: &GatewayServices) -> bool;
    /// A processor for `request`, or `None` when the strategy cannot serve it.
    fn create(
        &self,
        id: ProcessorId,
        priority: Priority,
        request: &BlobRequest,
        services: &GatewayServices,
    ) -> Option<Box<dyn BlobProcessor>>;
}

/// Strategies in priority order; registration order sets the priority.
#[derive(Default)]
pub struct ProcessorRegistry {
    factories: Vec<Arc<dyn ProcessorFactory>>,
}

impl ProcessorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the registry from configured strategies.
    pub fn from_config(processors: &[ProcessorConfig]) -> Self {
        let mut registry = Self::new();
        for config in processors {
            registry.register(Arc::new(GetBlobFactory::new(config.clone())));
        }
        registry
    }

    /// The two stock strategies: cache tier first, then the backend alone.
    pub fn build_default() -> Self {
        Self::from_config(&GatewayConfig::default().processors)
    }

    /// Appends a strategy and returns its priority.
    pub fn register(&mut self, factory: Arc<dyn ProcessorFactory>) -> Priority {
        let priority = self.factories.len() as Priority;
        debug!(name = factory.name(), priority, "processor registered");
        self.factories.push(factory);
        priority
    }

    /// Number of registered strategies.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// True when no strategy is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Strategy names in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// Creates a processor for every strategy that can handle `request`.
    pub fn instantiate(
        &self,
        request: &BlobRequest,
        services: &GatewayServices,
    ) -> Vec<Box<dyn BlobProcessor>> {
        let mut processors = Vec::new();
        for (priority, factory) in self.factories.iter().enumerate() {
            if !factory.can_handle(request, services) {
                debug!(name = factory.name(), blob = %request.blob_id, "processor declined");
                continue;
            }
            let id = ProcessorId(processors.len());
            if let Some(processor) = factory.create(id, priority as Priority, request, services) {
                processors.push(processor);
            }
        }
        processors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProcessorState::*;

    #[test]
    fn test_lifecycle_edges() {
        assert!(Created.can_transition_to(AwaitingAdmission));
        assert!(AwaitingAdmission.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Error));
        assert!(InProgress.can_transition_to(Canceled));
        assert!(AwaitingAdmission.can_transition_to(Canceled));

        assert!(!Created.can_transition_to(Canceled));
        assert!(!Created.can_transition_to(InProgress));
        assert!(!AwaitingAdmission.can_transition_to(Completed));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        for terminal in [Completed, Canceled, Error] {
            assert!(terminal.is_terminal());
            for next in [Created, AwaitingAdmission, InProgress, Completed, Canceled, Error] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_registry_priorities_follow_registration() {
        let registry = ProcessorRegistry::from_config(&[
            ProcessorConfig::new("first", "a", true, true, "memory"),
            ProcessorConfig::new("second", "b", false, true, "memory"),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names(), vec!["first", "second"]);
    }

    #[test]
    fn test_default_registry_puts_cache_first() {
        let registry = ProcessorRegistry::build_default();
        assert_eq!(registry.names(), vec!["cache-tier", "backend-direct"]);
    }
}
