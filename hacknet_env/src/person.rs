//! Person context abstraction: the per-connection surface the scheduler talks to.

use crate::error::EnvError;
use crate::event::OutputEvent;
use crate::types::{ContextId, OperationId};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Per-connection context shared between a network task and the tick thread.
///
/// The tick thread writes events and reads inputs; the network task submits
/// inputs and responses. Every method must keep its critical section short.
///
/// # Implementations
///
/// - `SessionContext` - in-memory buffers, optionally forwarding flushed
///   batches over a channel to a connection writer
pub trait PersonContext: Send + Sync {
    /// Returns this context's identifier.
    fn id(&self) -> ContextId;

    /// Buffers an event for delivery on the next flush.
    fn write_event(&self, event: OutputEvent);

    /// Delivers all buffered events.
    ///
    /// # Returns
    /// * `Err(EnvError::ContextClosed)` - the connection is gone; events are dropped
    fn flush(&self) -> Result<(), EnvError>;

    /// Stores an input line for the operation waiting on `operation_id`.
    fn submit_input(&self, operation_id: OperationId, text: String);

    /// Removes and returns the pending input for `operation_id`.
    fn take_input(&self, operation_id: OperationId) -> Option<String>;

    /// Stores a response for an interactive prompt (confirmations, edits).
    fn submit_response(&self, key: String, value: String);

    /// Removes and returns the response stored under `key`.
    fn take_response(&self, key: &str) -> Option<String>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory person context.
///
/// Without a sink, flushed events accumulate in a delivered log that tests
/// (and local consoles) read with [`SessionContext::take_delivered`].
pub struct SessionContext {
    /// This context's ID
    id: ContextId,

    /// Events written since the last flush
    outbox: Mutex<Vec<OutputEvent>>,

    /// Inputs keyed by the operation waiting for them
    pending_input: Mutex<HashMap<OperationId, String>>,

    /// Responses to interactive prompts
    responses: Mutex<HashMap<String, String>>,

    /// Connection writer, if attached
    sink: Option<mpsc::UnboundedSender<Vec<OutputEvent>>>,

    /// Flushed events when no sink is attached
    delivered: Mutex<Vec<OutputEvent>>,
}

impl SessionContext {
    /// Creates a detached context that keeps flushed events in memory.
    pub fn new(id: ContextId) -> Self {
        Self {
            id,
            outbox: Mutex::new(Vec::new()),
            pending_input: Mutex::new(HashMap::new()),
            responses: Mutex::new(HashMap::new()),
            sink: None,
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Creates a context whose flushes are forwarded to `sink`.
    pub fn with_sink(id: ContextId, sink: mpsc::UnboundedSender<Vec<OutputEvent>>) -> Self {
        Self {
            sink: Some(sink),
            ..Self::new(id)
        }
    }

    /// Returns and clears the events delivered so far (detached contexts only).
    pub fn take_delivered(&self) -> Vec<OutputEvent> {
        std::mem::take(&mut *lock(&self.delivered))
    }

    /// Returns the number of events waiting for a flush.
    pub fn buffered(&self) -> usize {
        lock(&self.outbox).len()
    }
}

impl PersonContext for SessionContext {
    fn id(&self) -> ContextId {
        self.id
    }

    fn write_event(&self, event: OutputEvent) {
        lock(&self.outbox).push(event);
    }

    fn flush(&self) -> Result<(), EnvError> {
        let batch = std::mem::take(&mut *lock(&self.outbox));
        if batch.is_empty() {
            return Ok(());
        }

        match &self.sink {
            Some(sink) => sink.send(batch).map_err(|_| EnvError::closed(self.id)),
            None => {
                lock(&self.delivered).extend(batch);
                Ok(())
            }
        }
    }

    fn submit_input(&self, operation_id: OperationId, text: String) {
        lock(&self.pending_input).insert(operation_id, text);
    }

    fn take_input(&self, operation_id: OperationId) -> Option<String> {
        lock(&self.pending_input).remove(&operation_id)
    }

    fn submit_response(&self, key: String, value: String) {
        lock(&self.responses).insert(key, value);
    }

    fn take_response(&self, key: &str) -> Option<String> {
        lock(&self.responses).remove(key)
    }
}
