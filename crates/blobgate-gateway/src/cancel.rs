//! Request cancellation for in-flight blob resolutions.
//!
//! A client going away, a deadline or a server shutdown cancels the request's
//! token; the dispatcher observes it between polling rounds and winds its
//! processors down cooperatively.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

/// Reasons for request cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Client went away
    ClientDisconnected,
    /// Deadline expired
    DeadlineExceeded,
    /// Server is shutting down
    ServerShutdown,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::ClientDisconnected => write!(f, "client disconnected"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
            CancelReason::ServerShutdown => write!(f, "server shutdown"),
        }
    }
}

#[derive(Default)]
struct CancelState {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    notify: Notify,
}

impl CancelState {
    fn cancel(&self, reason: CancelReason) {
        {
            let mut r = self.reason.lock();
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// A cloneable cancellation token observed by the request.
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// A token that is never cancelled by anyone else.
    pub fn detached() -> Self {
        new_cancel_pair().0
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Get the cancellation reason if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        *self.state.reason.lock()
    }

    /// Resolves once the token is cancelled and yields the reason.
    pub async fn cancelled(&self) -> CancelReason {
        loop {
            let notified = self.state.notify.notified();
            if let Some(reason) = self.cancelled_reason() {
                return reason;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.cancelled_reason())
            .finish()
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

impl CancelHandle {
    /// Trigger cancellation; the first reason wins.
    pub fn cancel(&self, reason: CancelReason) {
        self.state.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let state = Arc::new(CancelState::default());
    (
        CancelToken {
            state: state.clone(),
        },
        CancelHandle { state },
    )
}

/// Statistics about cancellation operations.
#[derive(Debug, Clone, Default)]
pub struct CancelStats {
    /// Total requests registered.
    pub total_registered: u64,
    /// Total requests cancelled.
    pub total_cancelled: u64,
    /// Total requests completed normally (removed).
    pub total_completed: u64,
    /// Currently active count.
    pub active_count: usize,
}

/// Tracks the cancellation handles of active requests.
#[derive(Default)]
pub struct CancelRegistry {
    handles: Mutex<HashMap<Uuid, CancelHandle>>,
    total_registered: AtomicU64,
    total_cancelled: AtomicU64,
    total_completed: AtomicU64,
}

impl CancelRegistry {
    /// Create a new registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new request, returning its token/handle.
    pub fn register(&self, request_id: Uuid) -> (CancelToken, CancelHandle) {
        let (token, handle) = new_cancel_pair();
        self.handles.lock().insert(request_id, handle.clone());
        self.total_registered.fetch_add(1, Ordering::Relaxed);
        (token, handle)
    }

    /// Cancel a specific request.
    pub fn cancel(&self, request_id: Uuid, reason: CancelReason) -> bool {
        let handle = self.handles.lock().get(&request_id).cloned();
        match handle {
            Some(handle) => {
                handle.cancel(reason);
                self.total_cancelled.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Cancel all active requests.
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let handles: Vec<CancelHandle> = self.handles.lock().values().cloned().collect();
        for handle in &handles {
            handle.cancel(reason);
        }
        self.total_cancelled
            .fetch_add(handles.len() as u64, Ordering::Relaxed);
        handles.len()
    }

    /// Remove a finished request.
    pub fn remove(&self, request_id: Uuid) {
        if self.handles.lock().remove(&request_id).is_some() {
            self.total_completed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Number of active cancellation tokens.
    pub fn active_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Get statistics snapshot.
    pub fn stats(&self) -> CancelStats {
        CancelStats {
            total_registered: self.total_registered.load(Ordering::Relaxed),
            total_cancelled: self.total_cancelled.load(Ordering::Relaxed),
            total_completed: self.total_completed.load(Ordering::Relaxed),
            active_count: self.active_count(),
        }
    }
}
