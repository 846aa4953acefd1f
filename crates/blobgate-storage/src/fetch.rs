//! Non-blocking adapter over one asynchronous backend exchange.
//!
//! A backend produces events through a [`FetchSender`]; the consumer polls the
//! matching [`FetchTask`] from its event loop. Every event fires the task's
//! data-ready notification, so the consumer never has to spin.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::StorageError;
use crate::record::BlobRecord;

/// What a fetch retrieves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchKind {
    /// Blob metadata
    Metadata,
    /// Blob payload chunks
    Bytes,
}

/// Where a fetch currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    /// Waiting for more events
    Pending,
    /// Finished with data (metadata found, or end-of-data chunk seen)
    Succeeded,
    /// Backend confirmed absence
    NotFound,
    /// Backend or protocol failure
    Failed,
    /// Consumer closed the fetch
    Canceled,
}

impl FetchStatus {
    /// True for every state except `Pending`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, FetchStatus::Pending)
    }
}

/// One event delivered by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Metadata lookup finished.
    Metadata {
        /// The record (default-valued when not found)
        record: BlobRecord,
        /// Whether the backend knows the blob
        found: bool,
    },
    /// A payload chunk; an empty chunk marks the end of data.
    Chunk {
        /// Position of the chunk in the payload
        index: u32,
        /// Chunk bytes
        data: Bytes,
    },
    /// Terminal failure.
    Error(StorageError),
}

#[derive(Default)]
struct DataReady {
    notify: Mutex<Option<Arc<Notify>>>,
}

impl DataReady {
    fn fire(&self) {
        if let Some(notify) = self.notify.lock().as_ref() {
            notify.notify_one();
        }
    }
}

/// Backend-side half of a fetch.
pub struct FetchSender {
    tx: Option<mpsc::UnboundedSender<FetchEvent>>,
    ready: Arc<DataReady>,
}

impl FetchSender {
    /// Reports the metadata outcome. Returns false if the consumer is gone.
    pub fn metadata(&self, record: BlobRecord, found: bool) -> bool {
        self.send(FetchEvent::Metadata { record, found })
    }

    /// Sends one payload chunk.
    pub fn chunk(&self, index: u32, data: Bytes) -> bool {
        self.send(FetchEvent::Chunk { index, data })
    }

    /// Sends the zero-length end-of-data chunk.
    pub fn end(&self, index: u32) -> bool {
        self.send(FetchEvent::Chunk {
            index,
            data: Bytes::new(),
        })
    }

    /// Reports a terminal failure.
    pub fn error(&self, err: StorageError) -> bool {
        self.send(FetchEvent::Error(err))
    }

    /// True once the consumer canceled or dropped the task.
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().map_or(true, |tx| tx.is_closed())
    }

    fn send(&self, event: FetchEvent) -> bool {
        let sent = self
            .tx
            .as_ref()
            .map_or(false, |tx| tx.send(event).is_ok());
        if sent {
            self.ready.fire();
        }
        sent
    }
}

impl Drop for FetchSender {
    fn drop(&mut self) {
        // The channel must read as disconnected before the consumer wakes.
        drop(self.tx.take());
        self.ready.fire();
    }
}

/// Consumer-side half of a fetch, polled from the request's event loop.
pub struct FetchTask {
    kind: FetchKind,
    label: String,
    rx: mpsc::UnboundedReceiver<FetchEvent>,
    ready: Arc<DataReady>,
    events: VecDeque<FetchEvent>,
    next_chunk: u32,
    status: FetchStatus,
    last_error: Option<StorageError>,
}

impl FetchTask {
    /// Creates a connected sender/task pair.
    pub fn channel(kind: FetchKind, label: impl Into<String>) -> (FetchSender, FetchTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ready = Arc::new(DataReady::default());
        let sender = FetchSender {
            tx: Some(tx),
            ready: ready.clone(),
        };
        let task = FetchTask {
            kind,
            label: label.into(),
            rx,
            ready,
            events: VecDeque::new(),
            next_chunk: 0,
            status: FetchStatus::Pending,
            last_error: None,
        };
        (sender, task)
    }

    /// Human-readable description used in logs.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Current status.
    pub fn status(&self) -> FetchStatus {
        self.status
    }

    /// True once the fetch will produce no further events.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// True if the fetch ended with an error (including not-found).
    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    /// The error that ended the fetch, if any.
    pub fn last_error(&self) -> Option<&StorageError> {
        self.last_error.as_ref()
    }

    /// Installs the readiness notification fired on every backend event.
    pub fn set_data_ready(&mut self, notify: Arc<Notify>) {
        *self.ready.notify.lock() = Some(notify.clone());
        // Events may have been queued before the callback existed.
        notify.notify_one();
    }

    /// Advances the fetch without blocking; returns true once terminal.
    pub fn wait(&mut self) -> bool {
        while !self.is_finished() {
            match self.rx.try_recv() {
                Ok(event) => self.accept(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.fail(StorageError::Abandoned),
            }
        }
        if self.is_finished() {
            self.rx.close();
        }
        self.is_finished()
    }

    #[cfg(test)]
    pub(crate) async fn drain(&mut self) {
        while !self.is_finished() {
            match self.rx.recv().await {
                Some(event) => self.accept(event),
                None => self.fail(StorageError::Abandoned),
            }
        }
        self.rx.close();
    }

    /// Pops the next validated event.
    pub fn next_event(&mut self) -> Option<FetchEvent> {
        self.events.pop_front()
    }

    /// Closes the fetch and throws away everything not yet consumed.
    pub fn cancel(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        let dropped = self.events.len();
        self.events.clear();
        if !self.is_finished() {
            self.status = FetchStatus::Canceled;
        }
        debug!(fetch = %self.label, dropped, "fetch canceled");
    }

    fn accept(&mut self, event: FetchEvent) {
        match event {
            FetchEvent::Metadata { record, found } => {
                if self.kind != FetchKind::Metadata {
                    self.fail(StorageError::ProtocolViolation(
                        "metadata event on a bytes fetch".to_string(),
                    ));
                    return;
                }
                self.status = if found {
                    FetchStatus::Succeeded
                } else {
                    FetchStatus::NotFound
                };
                self.events.push_back(FetchEvent::Metadata { record, found });
            }
            FetchEvent::Chunk { index, data } => {
                if self.kind != FetchKind::Bytes {
                    self.fail(StorageError::ProtocolViolation(
                        "chunk event on a metadata fetch".to_string(),
                    ));
                    return;
                }
                if index != self.next_chunk {
                    self.fail(StorageError::ProtocolViolation(format!(
                        "chunk {} arrived while expecting chunk {}",
                        index, self.next_chunk
                    )));
                    return;
                }
                self.next_chunk += 1;
                trace!(fetch = %self.label, index, len = data.len(), "chunk received");
                if data.is_empty() {
                    self.status = FetchStatus::Succeeded;
                }
                self.events.push_back(FetchEvent::Chunk { index, data });
            }
            FetchEvent::Error(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: StorageError) {
        self.status = if err.is_not_found() {
            FetchStatus::NotFound
        } else {
            FetchStatus::Failed
        };
        debug!(fetch = %self.label, error = %err, "fetch failed");
        self.last_error = Some(err.clone());
        self.events.push_back(FetchEvent::Error(err));
    }
}

impl std::fmt::Debug for FetchTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchTask")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .field("status", &self.status)
            .field("queued", &self.events.len())
            .finish()
    }
}
