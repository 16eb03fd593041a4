//! Operation - drives one process's step generator, one step per tick.

use crate::error::TaskError;
use crate::executable::{Step, StepContext};
use crate::process::{CompletionKind, Process, ProcessKey};
use crate::yield_token::YieldToken;

use hacknet_env::PersonContext;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{error, trace};

/// Per-tick driver owning exactly one process.
pub struct Operation {
    /// The driven process
    process: Process,

    /// Token the task is suspended on, if any
    token: Option<YieldToken>,

    /// Set when a step failed; the operation is then finished
    failure: Option<TaskError>,

    /// Steps executed so far
    steps: u64,
}

impl Operation {
    pub fn new(process: Process) -> Self {
        Self {
            process,
            token: None,
            failure: None,
            steps: 0,
        }
    }

    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }

    pub fn key(&self) -> ProcessKey {
        self.process.key()
    }

    /// True while a yielded token has not resumed.
    pub fn is_waiting(&self) -> bool {
        self.token.is_some()
    }

    pub fn failure(&self) -> Option<&TaskError> {
        self.failure.as_ref()
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// How the process should be completed once `update` reported done:
    /// `Normal` after a natural end, `KillRemote` after a failed step.
    pub fn completion_kind(&self) -> CompletionKind {
        if self.failure.is_some() {
            CompletionKind::KillRemote
        } else {
            CompletionKind::Normal
        }
    }

    /// Advances the operation by at most one step.
    ///
    /// A pending token is polled first; the task only runs once it resumed.
    /// A step error, or a panic in the step or the token, finishes the
    /// operation without touching any other process.
    ///
    /// # Returns
    /// `true` when the operation is finished and must be completed and
    /// removed by the caller.
    pub fn update(&mut self, cx: &mut StepContext<'_>) -> bool {
        let outcome = match self.poll_token(cx.delta()) {
            Ok(false) => return false,
            Ok(true) => {
                self.steps += 1;
                let task = self.process.task_mut();
                catch_unwind(AssertUnwindSafe(|| task.step(cx)))
                    .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))))
            }
            Err(e) => Err(e),
        };

        let done = match outcome {
            Ok(Step::Yield(token)) => {
                trace!(pid = self.process.pid(), ?token, "process yielded");
                self.token = token;
                false
            }
            Ok(Step::Done) => true,
            Err(e) => {
                error!(
                    world = %cx.world(),
                    system = %self.process.system(),
                    pid = self.process.pid(),
                    name = %self.process.info().name,
                    "process step failed: {}",
                    e
                );
                cx.error(format!("{}: {}", self.process.info().name, e));
                self.failure = Some(e);
                true
            }
        };

        if let Err(e) = self.process.origin().context.flush() {
            trace!(pid = self.process.pid(), "flush failed: {}", e);
        }
        done
    }

    /// Polls the pending token, if any. Predicates and actions are task
    /// code, so a panic in them fails the process like a panicking step.
    ///
    /// # Returns
    /// `Ok(true)` when the task may take its next step.
    fn poll_token(&mut self, delta: f64) -> Result<bool, TaskError> {
        let Some(token) = self.token.as_mut() else {
            return Ok(true);
        };
        match catch_unwind(AssertUnwindSafe(|| token.resume(delta))) {
            Ok(false) => Ok(false),
            Ok(true) => {
                self.token = None;
                Ok(true)
            }
            Err(payload) => {
                self.token = None;
                Err(TaskError::Panicked(panic_message(payload.as_ref())))
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executable::{task_fn, ExecutableRegistry};
    use crate::process::{Origin, ProcessInfo, ProcessTable};
    use crate::queue::CommandQueue;
    use crate::system::{SystemDirectory, VirtualSystem};
    use hacknet_env::{ContextId, OperationId, OutputEvent, SessionContext, SystemId, WorldId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Harness {
        ctx: Arc<SessionContext>,
        systems: SystemDirectory,
        table: ProcessTable,
        registry: ExecutableRegistry,
        queue: Arc<CommandQueue>,
        spawned: Vec<Operation>,
    }

    impl Harness {
        fn new() -> Self {
            let mut systems = SystemDirectory::new();
            systems.insert(VirtualSystem::new(SystemId(1), "box"));
            Self {
                ctx: Arc::new(SessionContext::new(ContextId::from_seed(1))),
                systems,
                table: ProcessTable::new(),
                registry: ExecutableRegistry::new(),
                queue: Arc::new(CommandQueue::new()),
                spawned: Vec::new(),
            }
        }

        fn operation(&self, task: Box<dyn crate::executable::Task>) -> Operation {
            let info = ProcessInfo {
                pid: 1,
                parent_pid: 0,
                system: SystemId(1),
                user: "root".to_string(),
                name: "test".to_string(),
                started_at: 0.0,
            };
            let origin = Origin {
                context: self.ctx.clone(),
                operation_id: OperationId(1),
                owns_operation: true,
            };
            Operation::new(Process::new(info, origin, task))
        }

        fn update(&mut self, op: &mut Operation, delta: f64) -> bool {
            let mut cx = StepContext {
                world: WorldId(0),
                time: 0.0,
                delta,
                me: op.process().info().clone(),
                origin: op.process().origin().clone(),
                systems: &mut self.systems,
                table: &self.table,
                registry: &self.registry,
                queue: &self.queue,
                spawned: &mut self.spawned,
            };
            op.update(&mut cx)
        }
    }

    #[test]
    fn test_first_update_runs_first_step() {
        let mut h = Harness::new();
        let mut op = h.operation(task_fn(|cx| {
            cx.print("hi");
            Ok(Step::Done)
        }));

        assert!(h.update(&mut op, 0.0));
        assert_eq!(op.completion_kind(), CompletionKind::Normal);
        assert_eq!(h.ctx.take_delivered()[0].as_output(), Some("hi"));
    }

    #[test]
    fn test_none_token_suspends_one_tick() {
        let mut h = Harness::new();
        let mut stage = 0;
        let mut op = h.operation(task_fn(move |_| {
            stage += 1;
            Ok(if stage < 3 { Step::tick() } else { Step::Done })
        }));

        assert!(!h.update(&mut op, 0.0));
        assert!(!h.update(&mut op, 0.0));
        assert!(h.update(&mut op, 0.0));
        assert_eq!(op.steps(), 3);
    }

    #[test]
    fn test_pending_token_blocks_step() {
        let mut h = Harness::new();
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let mut op = h.operation(task_fn(move |_| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Ok(if n == 0 {
                Step::wait(YieldToken::delay(1.0))
            } else {
                Step::Done
            })
        }));

        assert!(!h.update(&mut op, 0.0));
        assert!(op.is_waiting());
        assert!(!h.update(&mut op, 0.5));
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert!(h.update(&mut op, 0.5));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_resumed_token_is_not_polled_again() {
        let mut h = Harness::new();
        let polls = Arc::new(AtomicUsize::new(0));
        let poll_counter = polls.clone();
        let mut yielded = false;
        let mut op = h.operation(task_fn(move |_| {
            if yielded {
                // Suspend on a token that never resumes
                return Ok(Step::wait(YieldToken::condition(|| false)));
            }
            yielded = true;
            let counter = poll_counter.clone();
            Ok(Step::wait(YieldToken::condition(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })))
        }));

        assert!(!h.update(&mut op, 0.0));
        assert!(!h.update(&mut op, 0.0));
        assert!(!h.update(&mut op, 0.0));
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_step_error_finishes_with_kill_remote() {
        let mut h = Harness::new();
        let mut op = h.operation(task_fn(|_| Err(TaskError::failed("disk on fire"))));

        assert!(h.update(&mut op, 0.0));
        assert_eq!(op.completion_kind(), CompletionKind::KillRemote);
        assert!(matches!(
            h.ctx.take_delivered().first(),
            Some(OutputEvent::Error { .. })
        ));
    }

    #[test]
    fn test_token_panic_fails_process() {
        let mut h = Harness::new();
        let mut op = h.operation(task_fn(|_| Ok(Step::wait(YieldToken::condition(|| panic!("bad predicate"))))));

        assert!(!h.update(&mut op, 0.0));
        assert!(h.update(&mut op, 0.0));
        assert_eq!(op.completion_kind(), CompletionKind::KillRemote);
        assert_eq!(op.failure(), Some(&TaskError::Panicked("bad predicate".to_string())));
        assert!(!op.is_waiting());
        assert_eq!(op.steps(), 1);
    }

    #[test]
    fn test_step_panic_is_contained() {
        let mut h = Harness::new();
        let mut op = h.operation(task_fn(|_| panic!("boom")));

        assert!(h.update(&mut op, 0.0));
        assert_eq!(op.failure(), Some(&TaskError::Panicked("boom".to_string())));
    }
}
