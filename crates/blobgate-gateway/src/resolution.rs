//! Cross-processor resolution event for one request.
//!
//! Installed before any processor starts, so a processor that has not begun
//! yet still sees a sibling's win.

use std::collections::HashMap;

use tracing::debug;

use crate::cancel::CancelReason;
use crate::processor::ProcessorId;

/// Result of trying to become the request's winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This processor is the winner
    Won,
    /// Another processor already won
    Lost,
}

/// Winner and group lock bookkeeping shared by the processors of one request.
#[derive(Debug, Default)]
pub struct ResolutionEvent {
    winner: Option<ProcessorId>,
    external: Option<CancelReason>,
    group_locks: HashMap<String, ProcessorId>,
    unlocks: u64,
}

impl ResolutionEvent {
    /// No winner and no locks.
    pub fn new() -> Self {
        Self::default()
    }

    /// First claim wins; the winner may claim again.
    pub fn claim(&mut self, id: ProcessorId) -> Claim {
        match self.winner {
            None => {
                debug!(winner = id.0, "resolution claimed");
                self.winner = Some(id);
                Claim::Won
            }
            Some(winner) if winner == id => Claim::Won,
            Some(_) => Claim::Lost,
        }
    }

    /// The winning processor, if any.
    pub fn winner(&self) -> Option<ProcessorId> {
        self.winner
    }

    /// Marks the whole request canceled from outside.
    pub fn cancel_external(&mut self, reason: CancelReason) {
        if self.external.is_none() {
            self.external = Some(reason);
        }
    }

    /// The outside cancellation reason, if any.
    pub fn external_cancel(&self) -> Option<CancelReason> {
        self.external
    }

    /// True if `id` must stop: someone else won, or the request was canceled.
    pub fn is_canceled_for(&self, id: ProcessorId) -> bool {
        self.external.is_some() || self.winner.is_some_and(|w| w != id)
    }

    /// Takes the group lock for `id`; true if `id` now holds it.
    pub fn lock_group(&mut self, group: &str, id: ProcessorId) -> bool {
        let holder = self.group_locks.entry(group.to_string()).or_insert(id);
        *holder == id
    }

    /// True if another processor holds `group`.
    pub fn is_group_locked_by_other(&self, group: &str, id: ProcessorId) -> bool {
        self.group_locks.get(group).is_some_and(|holder| *holder != id)
    }

    /// Releases the group lock if `id` holds it. Repeated calls are no-ops.
    pub fn unlock(&mut self, group: &str, id: ProcessorId) -> bool {
        if self.group_locks.get(group) == Some(&id) {
            self.group_locks.remove(group);
            self.unlocks += 1;
            debug!(group, holder = id.0, "group unlocked");
            true
        } else {
            false
        }
    }

    /// Number of effective unlocks so far.
    pub fn unlock_count(&self) -> u64 {
        self.unlocks
    }
}
