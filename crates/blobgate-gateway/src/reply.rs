//! Reply sinks and the per-request reply gate.
//!
//! A [`ReplySink`] is the streaming channel back to the client. The
//! [`ReplyGate`] sits in front of it for one request: only the winning
//! processor may stream, failures are collected rather than written, and
//! exactly one terminal outcome reaches the sink.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::error::{ResolveError, Severity, STATUS_INTERNAL, STATUS_OK};
use crate::processor::ProcessorId;

/// Whether a sink took a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// The bytes were taken
    Accepted,
    /// The sink is full; the caller keeps the bytes and retries later
    Backpressure,
}

/// How far a flush goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Push out what has been written so far
    SendAccumulated,
    /// Push out everything and close the reply
    SendAndFinish,
}

/// Streaming output channel to one client.
pub trait ReplySink: Send {
    /// Hands `data` to the client unless the sink is full.
    fn send(&mut self, data: Bytes) -> SendStatus;
    /// True while the sink accepts data.
    fn is_output_ready(&self) -> bool;
    /// Pushes buffered output out.
    fn flush(&mut self, mode: FlushMode);
    /// Queues an error message for the client.
    fn prepare_error_message(&mut self, status: u16, severity: Severity, text: &str);
    /// True once the reply was closed.
    fn is_finished(&self) -> bool;
    /// Notification fired when the sink leaves backpressure.
    fn set_ready_notify(&mut self, notify: Arc<Notify>);
}

/// What a client reads from a [`MemoryReply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyItem {
    /// Payload bytes
    Data(Bytes),
    /// A status message
    Message {
        /// HTTP-style status
        status: u16,
        /// Message severity
        severity: Severity,
        /// Message text
        text: String,
    },
    /// The reply was closed
    Finished,
}

struct ReplyState {
    queue: VecDeque<ReplyItem>,
    buffered: usize,
    capacity: usize,
    finished: bool,
    ready_notify: Option<Arc<Notify>>,
    writes_after_finish: usize,
}

struct ReplyShared {
    state: Mutex<ReplyState>,
    reader_wake: Notify,
}

/// In-memory reply with a byte capacity.
pub struct MemoryReply {
    shared: Arc<ReplyShared>,
}

/// Client side of a [`MemoryReply`].
pub struct MemoryReplyReader {
    shared: Arc<ReplyShared>,
}

impl MemoryReply {
    /// Creates a reply that buffers up to `capacity` unread bytes.
    pub fn new(capacity: usize) -> (MemoryReply, MemoryReplyReader) {
        let shared = Arc::new(ReplyShared {
            state: Mutex::new(ReplyState {
                queue: VecDeque::new(),
                buffered: 0,
                capacity: capacity.max(1),
                finished: false,
                ready_notify: None,
                writes_after_finish: 0,
            }),
            reader_wake: Notify::new(),
        });
        (
            MemoryReply {
                shared: shared.clone(),
            },
            MemoryReplyReader { shared },
        )
    }

    fn push(&self, item: ReplyItem) {
        let mut state = self.shared.state.lock();
        if state.finished {
            state.writes_after_finish += 1;
            return;
        }
        if let ReplyItem::Data(data) = &item {
            state.buffered += data.len();
        }
        if item == ReplyItem::Finished {
            state.finished = true;
        }
        state.queue.push_back(item);
        drop(state);
        self.shared.reader_wake.notify_one();
    }
}

impl ReplySink for MemoryReply {
    fn send(&mut self, data: Bytes) -> SendStatus {
        if !self.is_output_ready() {
            return SendStatus::Backpressure;
        }
        self.push(ReplyItem::Data(data));
        SendStatus::Accepted
    }

    fn is_output_ready(&self) -> bool {
        let state = self.shared.state.lock();
        state.finished || state.buffered < state.capacity
    }

    fn flush(&mut self, mode: FlushMode) {
        if mode == FlushMode::SendAndFinish {
            self.push(ReplyItem::Finished);
        } else {
            self.shared.reader_wake.notify_one();
        }
    }

    fn prepare_error_message(&mut self, status: u16, severity: Severity, text: &str) {
        self.push(ReplyItem::Message {
            status,
            severity,
            text: text.to_string(),
        });
    }

    fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    fn set_ready_notify(&mut self, notify: Arc<Notify>) {
        self.shared.state.lock().ready_notify = Some(notify);
    }
}

/// Everything a client read from one reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplyTranscript {
    /// Payload bytes in order
    pub data: Vec<u8>,
    /// Status messages with severity and text
    pub messages: Vec<(u16, Severity, String)>,
    /// Whether the reply was closed
    pub finished: bool,
    /// Data items seen after the first message
    pub data_after_message: usize,
}

impl ReplyTranscript {
    /// Terminal outcomes: one per message, or one successful stream.
    pub fn terminal_outcomes(&self) -> usize {
        let errors = self
            .messages
            .iter()
            .filter(|(status, _, _)| *status != STATUS_OK)
            .count();
        if errors == 0 && self.finished {
            1
        } else {
            errors
        }
    }
}

impl MemoryReplyReader {
    /// Pops the next item without waiting.
    pub fn try_next(&self) -> Option<ReplyItem> {
        let mut state = self.shared.state.lock();
        let item = state.queue.pop_front()?;
        if let ReplyItem::Data(data) = &item {
            let was_full = state.buffered >= state.capacity;
            state.buffered -= data.len();
            if was_full && state.buffered < state.capacity {
                if let Some(notify) = &state.ready_notify {
                    notify.notify_one();
                }
            }
        }
        Some(item)
    }

    /// Waits for the next item; `None` once the reply is finished and read.
    pub async fn next(&self) -> Option<ReplyItem> {
        loop {
            let notified = self.shared.reader_wake.notified();
            if let Some(item) = self.try_next() {
                return Some(item);
            }
            if self.shared.state.lock().finished {
                return None;
            }
            notified.await;
        }
    }

    /// Reads until the reply is finished.
    pub async fn read_to_end(&self) -> ReplyTranscript {
        let mut transcript = ReplyTranscript::default();
        while let Some(item) = self.next().await {
            transcript.record(item);
        }
        transcript
    }

    /// Reads whatever is queued right now.
    pub fn read_available(&self) -> ReplyTranscript {
        let mut transcript = ReplyTranscript::default();
        while let Some(item) = self.try_next() {
            transcript.record(item);
        }
        transcript
    }

    /// Writes the sink received after it was finished.
    pub fn writes_after_finish(&self) -> usize {
        self.shared.state.lock().writes_after_finish
    }
}

impl ReplyTranscript {
    fn record(&mut self, item: ReplyItem) {
        match item {
            ReplyItem::Data(data) => {
                if !self.messages.is_empty() {
                    self.data_after_message += 1;
                }
                self.data.extend_from_slice(&data);
            }
            ReplyItem::Message {
                status,
                severity,
                text,
            } => self.messages.push((status, severity, text)),
            ReplyItem::Finished => self.finished = true,
        }
    }
}

/// A failure a processor reported instead of writing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Processor that reported it
    pub from: Option<ProcessorId>,
    /// HTTP-style status
    pub status: u16,
    /// Message severity
    pub severity: Severity,
    /// Message text
    pub message: String,
}

impl Failure {
    /// Failure from `from` carrying `err`.
    pub fn new(from: Option<ProcessorId>, err: &ResolveError) -> Self {
        Self {
            from,
            status: err.http_status(),
            severity: err.severity(),
            message: err.to_string(),
        }
    }
}

/// Per-request gate in front of the reply sink.
pub struct ReplyGate {
    sink: Box<dyn ReplySink>,
    writer: Option<ProcessorId>,
    pending: VecDeque<Bytes>,
    bytes_delivered: u64,
    failures: Vec<Failure>,
    notice: Option<Failure>,
    finished: Option<u16>,
}

impl ReplyGate {
    /// Wraps `sink`, wiring its backpressure relief to `waker`.
    pub fn new(mut sink: Box<dyn ReplySink>, waker: Arc<Notify>) -> Self {
        sink.set_ready_notify(waker);
        Self {
            sink,
            writer: None,
            pending: VecDeque::new(),
            bytes_delivered: 0,
            failures: Vec::new(),
            notice: None,
            finished: None,
        }
    }

    /// Grants `id` the right to stream. The first binding sticks.
    pub fn bind_writer(&mut self, id: ProcessorId) -> bool {
        match self.writer {
            None => {
                self.writer = Some(id);
                true
            }
            Some(current) => current == id,
        }
    }

    /// The bound writer, if any.
    pub fn writer(&self) -> Option<ProcessorId> {
        self.writer
    }

    /// Queues bytes from the writer; anyone else is refused.
    pub fn write(&mut self, from: ProcessorId, data: Bytes) -> bool {
        if self.writer != Some(from) || self.finished.is_some() {
            trace!(from = from.0, len = data.len(), "write refused");
            return false;
        }
        if !data.is_empty() {
            self.pending.push_back(data);
        }
        self.pump();
        true
    }

    /// Hands queued bytes to the sink until it pushes back.
    pub fn pump(&mut self) -> u64 {
        let mut sent = 0;
        while let Some(front) = self.pending.front() {
            let len = front.len() as u64;
            match self.sink.send(front.clone()) {
                SendStatus::Accepted => {
                    self.pending.pop_front();
                    sent += len;
                }
                SendStatus::Backpressure => break,
            }
        }
        self.bytes_delivered += sent;
        sent
    }

    /// True while bytes from `id` wait on backpressure.
    pub fn has_pending_for(&self, id: ProcessorId) -> bool {
        self.writer == Some(id) && !self.pending.is_empty()
    }

    /// Drops queued bytes from `id` (a canceled writer).
    pub fn discard_from(&mut self, id: ProcessorId) -> usize {
        if self.writer != Some(id) {
            return 0;
        }
        let dropped = self.pending.len();
        self.pending.clear();
        dropped
    }

    /// Hands queued bytes to the sink and flushes what it accepted.
    pub fn flush(&mut self) {
        if self.finished.is_some() {
            return;
        }
        self.pump();
        self.sink.flush(FlushMode::SendAccumulated);
    }

    /// Remembers a failure for [`ReplyGate::finish`].
    pub fn record_failure(&mut self, from: Option<ProcessorId>, err: &ResolveError) {
        debug!(from = ?from.map(|id| id.0), status = err.http_status(), error = %err, "failure recorded");
        self.failures.push(Failure::new(from, err));
    }

    /// Status-200 notice written in place of data ("blob excluded").
    pub fn set_notice(&mut self, from: ProcessorId, text: String) {
        self.notice = Some(Failure {
            from: Some(from),
            status: STATUS_OK,
            severity: Severity::Info,
            message: text,
        });
    }

    /// Failures recorded so far.
    pub fn failures(&self) -> &[Failure] {
        &self.failures
    }

    /// Payload bytes the sink accepted.
    pub fn bytes_delivered(&self) -> u64 {
        self.bytes_delivered
    }

    /// True once the terminal outcome was written.
    pub fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Writes the one terminal outcome and closes the sink. Later calls
    /// return the same status without touching the sink.
    pub fn finish(&mut self) -> u16 {
        if let Some(status) = self.finished {
            return status;
        }
        self.pump();
        let dropped = self.pending.len();
        if dropped > 0 {
            debug!(dropped, "pending chunks dropped at finish");
            self.pending.clear();
        }

        let writer_failure = self
            .writer
            .and_then(|w| self.failures.iter().find(|f| f.from == Some(w)).cloned());

        let status = match (self.writer, writer_failure) {
            (Some(_), None) => {
                if let Some(notice) = self.notice.take() {
                    self.sink
                        .prepare_error_message(notice.status, notice.severity, &notice.message);
                }
                STATUS_OK
            }
            (Some(_), Some(failure)) if self.bytes_delivered > 0 => {
                self.sink
                    .prepare_error_message(failure.status, failure.severity, &failure.message);
                failure.status
            }
            _ => {
                let worst = self.failures.iter().max_by_key(|f| f.status).cloned();
                let failure = worst.unwrap_or_else(|| Failure {
                    from: None,
                    status: STATUS_INTERNAL,
                    severity: Severity::Critical,
                    message: "request finished without an outcome".to_string(),
                });
                self.sink
                    .prepare_error_message(failure.status, failure.severity, &failure.message);
                failure.status
            }
        };

        self.sink.flush(FlushMode::SendAndFinish);
        self.finished = Some(status);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobgate_storage::BlobId;

    fn gate(capacity: usize) -> (ReplyGate, MemoryReplyReader, Arc<Notify>) {
        let (sink, reader) = MemoryReply::new(capacity);
        let waker = Arc::new(Notify::new());
        (ReplyGate::new(Box::new(sink), waker.clone()), reader, waker)
    }

    fn not_found() -> ResolveError {
        ResolveError::NotFound {
            blob_id: BlobId::new(4, 1),
            reason: "no metadata".into(),
        }
    }

    #[test]
    fn test_memory_reply_backpressure() {
        let (mut sink, reader) = MemoryReply::new(4);
        assert_eq!(sink.send(Bytes::from_static(b"abcd")), SendStatus::Accepted);
        assert!(!sink.is_output_ready());
        assert_eq!(sink.send(Bytes::from_static(b"e")), SendStatus::Backpressure);
        assert_eq!(reader.try_next(), Some(ReplyItem::Data(Bytes::from_static(b"abcd"))));
        assert!(sink.is_output_ready());
    }

    #[tokio::test]
    async fn test_reader_frees_capacity_and_notifies() {
        let (mut sink, reader) = MemoryReply::new(2);
        let notify = Arc::new(Notify::new());
        sink.set_ready_notify(notify.clone());
        sink.send(Bytes::from_static(b"xy"));
        reader.try_next();
        notify.notified().await;
        assert!(sink.is_output_ready());
    }

    #[test]
    fn test_writes_after_finish_are_counted() {
        let (mut sink, reader) = MemoryReply::new(16);
        sink.flush(FlushMode::SendAndFinish);
        sink.prepare_error_message(500, Severity::Error, "late");
        assert!(sink.is_finished());
        assert_eq!(reader.writes_after_finish(), 1);
    }

    #[test]
    fn test_only_writer_streams() {
        let (mut gate, reader, _) = gate(1024);
        assert!(gate.bind_writer(ProcessorId(1)));
        assert!(!gate.bind_writer(ProcessorId(0)));
        assert!(gate.write(ProcessorId(1), Bytes::from_static(b"abc")));
        assert!(!gate.write(ProcessorId(0), Bytes::from_static(b"zzz")));
        assert_eq!(gate.finish(), 200);

        let transcript = reader.read_available();
        assert_eq!(transcript.data, b"abc");
        assert!(transcript.messages.is_empty());
        assert!(transcript.finished);
        assert_eq!(transcript.terminal_outcomes(), 1);
    }

    #[test]
    fn test_highest_status_failure_wins() {
        let (mut gate, reader, _) = gate(1024);
        gate.record_failure(Some(ProcessorId(0)), &not_found());
        gate.record_failure(
            Some(ProcessorId(1)),
            &ResolveError::Transport("reset".into()),
        );
        assert_eq!(gate.finish(), 500);

        let transcript = reader.read_available();
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.messages[0].0, 500);
        assert!(transcript.data.is_empty());
    }

    #[test]
    fn test_success_discards_sibling_failures() {
        let (mut gate, reader, _) = gate(1024);
        gate.record_failure(Some(ProcessorId(0)), &not_found());
        gate.bind_writer(ProcessorId(1));
        gate.write(ProcessorId(1), Bytes::from_static(b"data"));
        assert_eq!(gate.finish(), 200);
        let transcript = reader.read_available();
        assert!(transcript.messages.is_empty());
        assert_eq!(transcript.data, b"data");
    }

    #[test]
    fn test_writer_failure_mid_stream_is_trailing() {
        let (mut gate, reader, _) = gate(1024);
        gate.bind_writer(ProcessorId(0));
        gate.write(ProcessorId(0), Bytes::from_static(b"part"));
        gate.record_failure(
            Some(ProcessorId(0)),
            &ResolveError::Transport("reset".into()),
        );
        assert_eq!(gate.finish(), 500);
        let transcript = reader.read_available();
        assert_eq!(transcript.data, b"part");
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(transcript.data_after_message, 0);
    }

    #[test]
    fn test_writer_failure_before_bytes_is_plain_error() {
        let (mut gate, reader, _) = gate(1024);
        gate.bind_writer(ProcessorId(0));
        gate.record_failure(
            Some(ProcessorId(0)),
            &ResolveError::ProtocolViolation("bad".into()),
        );
        assert_eq!(gate.finish(), 500);
        assert_eq!(reader.read_available().terminal_outcomes(), 1);
    }

    #[test]
    fn test_pending_bytes_wait_for_capacity() {
        let (mut gate, reader, _) = gate(3);
        gate.bind_writer(ProcessorId(0));
        gate.write(ProcessorId(0), Bytes::from_static(b"abc"));
        gate.write(ProcessorId(0), Bytes::from_static(b"def"));
        assert!(gate.has_pending_for(ProcessorId(0)));
        assert_eq!(gate.bytes_delivered(), 3);

        reader.try_next();
        assert_eq!(gate.pump(), 3);
        assert!(!gate.has_pending_for(ProcessorId(0)));
    }

    #[test]
    fn test_finish_is_idempotent() {
        let (mut gate, reader, _) = gate(64);
        gate.record_failure(None, &not_found());
        assert_eq!(gate.finish(), 404);
        assert_eq!(gate.finish(), 404);
        assert!(gate.is_finished());
        let transcript = reader.read_available();
        assert_eq!(transcript.messages.len(), 1);
        assert_eq!(reader.writes_after_finish(), 0);
    }

    #[test]
    fn test_notice_for_excluded_blob() {
        let (mut gate, reader, _) = gate(64);
        gate.bind_writer(ProcessorId(2));
        gate.set_notice(ProcessorId(2), "blob 4.1 excluded".into());
        assert_eq!(gate.finish(), 200);
        let transcript = reader.read_available();
        assert_eq!(transcript.messages, vec![(200, Severity::Info, "blob 4.1 excluded".to_string())]);
        assert_eq!(transcript.terminal_outcomes(), 1);
    }

    #[test]
    fn test_empty_gate_still_finishes_once() {
        let (mut gate, reader, _) = gate(64);
        assert_eq!(gate.finish(), 500);
        assert_eq!(reader.read_available().terminal_outcomes(), 1);
    }
}
