//! Command ingestion queue bridging network tasks and the tick thread.
//!
//! Any number of producers call `enqueue*` concurrently; the tick driver
//! calls [`CommandQueue::drain_into`] once per tick, which takes every
//! queued entry in arrival order under the same lock.

use crate::error::KillError;
use crate::lock;
use crate::process::CompletionKind;

use hacknet_env::{OperationId, PersonContext, Pid, SystemId, WorldId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

/// What a queued entry asks the World to do.
pub enum QueuedRequest {
    /// Run a command line on the context's current system
    Command { line: String },

    /// Cascade-kill a process. `system: None` means the context's current system.
    Kill {
        system: Option<SystemId>,
        pid: Pid,
        kind: CompletionKind,
        ticket: Option<KillTicket>,
    },

    /// Log the context in on a system and start its shell
    Login { hostname: String, user: String },

    /// The connection behind the context is gone; end all of its logins
    Disconnect,
}

impl fmt::Debug for QueuedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuedRequest::Command { line } => f.debug_struct("Command").field("line", line).finish(),
            QueuedRequest::Kill { system, pid, kind, ticket } => f
                .debug_struct("Kill")
                .field("system", system)
                .field("pid", pid)
                .field("kind", kind)
                .field("ticketed", &ticket.is_some())
                .finish(),
            QueuedRequest::Login { hostname, user } => f
                .debug_struct("Login")
                .field("hostname", hostname)
                .field("user", user)
                .finish(),
            QueuedRequest::Disconnect => f.write_str("Disconnect"),
        }
    }
}

/// One queued entry.
pub struct QueuedCommand {
    /// World the request targets
    pub world: WorldId,

    /// Context that issued it and receives its output
    pub context: Arc<dyn PersonContext>,

    /// Operation the output is tagged with
    pub operation_id: OperationId,

    pub request: QueuedRequest,
}

impl fmt::Debug for QueuedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedCommand")
            .field("world", &self.world)
            .field("context", &self.context.id())
            .field("operation_id", &self.operation_id)
            .field("request", &self.request)
            .finish()
    }
}

/// Outcome slot of a kill request, filled during dispatch.
#[derive(Clone, Default)]
pub struct KillTicket(Arc<Mutex<Option<Result<Vec<Pid>, KillError>>>>);

impl KillTicket {
    pub(crate) fn resolve(&self, outcome: Result<Vec<Pid>, KillError>) {
        *lock(&self.0) = Some(outcome);
    }

    pub fn is_resolved(&self) -> bool {
        lock(&self.0).is_some()
    }

    /// The kill outcome, once dispatched.
    pub fn outcome(&self) -> Option<Result<Vec<Pid>, KillError>> {
        lock(&self.0).clone()
    }
}

/// Thread-safe FIFO of requests for the tick driver.
#[derive(Default)]
pub struct CommandQueue {
    entries: Mutex<VecDeque<QueuedCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an entry.
    pub fn push(&self, command: QueuedCommand) {
        lock(&self.entries).push_back(command);
    }

    /// Queues a command line.
    pub fn enqueue(
        &self,
        world: WorldId,
        context: Arc<dyn PersonContext>,
        operation_id: OperationId,
        line: impl Into<String>,
    ) {
        self.push(QueuedCommand {
            world,
            context,
            operation_id,
            request: QueuedRequest::Command { line: line.into() },
        });
    }

    /// Queues a kill request.
    #[allow(clippy::too_many_arguments)]
    pub fn enqueue_kill(
        &self,
        world: WorldId,
        context: Arc<dyn PersonContext>,
        operation_id: OperationId,
        system: Option<SystemId>,
        pid: Pid,
        kind: CompletionKind,
        ticket: Option<KillTicket>,
    ) {
        self.push(QueuedCommand {
            world,
            context,
            operation_id,
            request: QueuedRequest::Kill {
                system,
                pid,
                kind,
                ticket,
            },
        });
    }

    /// Queues a login.
    pub fn enqueue_login(
        &self,
        world: WorldId,
        context: Arc<dyn PersonContext>,
        operation_id: OperationId,
        hostname: impl Into<String>,
        user: impl Into<String>,
    ) {
        self.push(QueuedCommand {
            world,
            context,
            operation_id,
            request: QueuedRequest::Login {
                hostname: hostname.into(),
                user: user.into(),
            },
        });
    }

    /// Queues the teardown of a closed connection's logins.
    pub fn enqueue_disconnect(&self, world: WorldId, context: Arc<dyn PersonContext>) {
        self.push(QueuedCommand {
            world,
            context,
            operation_id: OperationId(0),
            request: QueuedRequest::Disconnect,
        });
    }

    /// Moves every queued entry, in arrival order, to the end of `working`.
    ///
    /// # Returns
    /// Number of entries moved.
    pub fn drain_into(&self, working: &mut Vec<QueuedCommand>) -> usize {
        let mut entries = lock(&self.entries);
        let count = entries.len();
        working.extend(entries.drain(..));
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hacknet_env::{ContextId, SessionContext};
    use proptest::prelude::*;
    use std::thread;

    fn context(seed: u64) -> Arc<dyn PersonContext> {
        Arc::new(SessionContext::new(ContextId::from_seed(seed)))
    }

    fn line(cmd: &QueuedCommand) -> &str {
        match &cmd.request {
            QueuedRequest::Command { line } => line,
            other => panic!("unexpected request {:?}", other),
        }
    }

    #[test]
    fn test_fifo_drain() {
        let queue = CommandQueue::new();
        let ctx = context(1);
        for i in 0..5 {
            queue.enqueue(WorldId(0), ctx.clone(), OperationId(i), format!("echo {}", i));
        }

        let mut working = Vec::new();
        assert_eq!(queue.drain_into(&mut working), 5);
        assert!(queue.is_empty());
        let lines: Vec<&str> = working.iter().map(line).collect();
        assert_eq!(lines, vec!["echo 0", "echo 1", "echo 2", "echo 3", "echo 4"]);

        assert_eq!(queue.drain_into(&mut working), 0);
        assert_eq!(working.len(), 5);
    }

    #[test]
    fn test_kill_ticket_resolution() {
        let ticket = KillTicket::default();
        assert!(!ticket.is_resolved());
        ticket.resolve(Err(KillError::Vetoed { pid: 4 }));
        assert!(ticket.is_resolved());
        assert_eq!(ticket.outcome(), Some(Err(KillError::Vetoed { pid: 4 })));
    }

    #[test]
    fn test_concurrent_producers_no_loss_per_producer_order() {
        const PRODUCERS: usize = 8;
        const PER_PRODUCER: usize = 500;

        let queue = Arc::new(CommandQueue::new());
        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let ctx = context(p as u64);
                    for i in 0..PER_PRODUCER {
                        queue.enqueue(WorldId(0), ctx.clone(), OperationId(i as u64), format!("{} {}", p, i));
                    }
                })
            })
            .collect();

        // Drain while producers are still running
        let mut working = Vec::new();
        while working.len() < PRODUCERS * PER_PRODUCER {
            queue.drain_into(&mut working);
            thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        queue.drain_into(&mut working);

        assert_eq!(working.len(), PRODUCERS * PER_PRODUCER);
        let mut next = vec![0usize; PRODUCERS];
        for cmd in &working {
            let mut parts = line(cmd).split(' ');
            let p: usize = parts.next().unwrap().parse().unwrap();
            let i: usize = parts.next().unwrap().parse().unwrap();
            assert_eq!(i, next[p], "producer {} out of order", p);
            next[p] += 1;
        }
        assert!(next.iter().all(|n| *n == PER_PRODUCER));
    }

    proptest! {
        #[test]
        fn test_interleaved_drains_preserve_order(ops in proptest::collection::vec(any::<bool>(), 1..100)) {
            let queue = CommandQueue::new();
            let ctx = context(9);
            let mut working = Vec::new();
            let mut sent = 0u64;
            for push in ops {
                if push {
                    queue.enqueue(WorldId(0), ctx.clone(), OperationId(sent), "x");
                    sent += 1;
                } else {
                    queue.drain_into(&mut working);
                }
            }
            queue.drain_into(&mut working);

            let ids: Vec<u64> = working.iter().map(|c| c.operation_id.0).collect();
            prop_assert_eq!(ids, (0..sent).collect::<Vec<_>>());
        }
    }
}
