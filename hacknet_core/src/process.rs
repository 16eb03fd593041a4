//! Processes, completion, and the cascading kill protocol.
//!
//! A [`Process`] is the runtime wrapper around one task body. The World
//! keeps every live process inside its [`Operation`] in a [`ProcessTable`]
//! keyed by `(system, pid)`; parent links are plain pids into that table.

use crate::error::{DispatchError, KillError};
use crate::executable::{CompletionContext, ExecutableRegistry, Invocation, Task};
use crate::lock;
use crate::operation::{panic_message, Operation};
use crate::system::SystemDirectory;

use hacknet_env::{OperationId, OutputEvent, PersonContext, Pid, SystemId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// How a process came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionKind {
    /// The task body ran to its end
    Normal,

    /// Killed interactively on the same system (`kill <pid>`)
    KillLocal,

    /// Forced shutdown (system reboot, step failure, server stop)
    KillRemote,
}

impl CompletionKind {
    /// True for both kill kinds.
    pub fn is_kill(&self) -> bool {
        !matches!(self, CompletionKind::Normal)
    }

    /// Forced completions cannot be vetoed.
    pub fn is_forced(&self) -> bool {
        matches!(self, CompletionKind::KillRemote)
    }
}

/// Where a process reports its output.
#[derive(Clone)]
pub struct Origin {
    /// Person context receiving events
    pub context: Arc<dyn PersonContext>,

    /// Operation the events are tagged with
    pub operation_id: OperationId,

    /// Whether completing this process completes the operation
    /// (false for children sharing their parent's operation)
    pub owns_operation: bool,
}

/// Key of a process in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessKey {
    pub system: SystemId,
    pub pid: Pid,
}

impl ProcessKey {
    pub fn new(system: SystemId, pid: Pid) -> Self {
        Self { system, pid }
    }
}

/// Read-only description of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub parent_pid: Pid,
    pub system: SystemId,
    pub user: String,
    pub name: String,
    pub started_at: f64,
}

/// Completion signal other tasks can wait on.
#[derive(Clone, Default)]
pub struct ExitWatch(Arc<Mutex<Option<CompletionKind>>>);

impl ExitWatch {
    fn set(&self, kind: CompletionKind) {
        let mut slot = lock(&self.0);
        if slot.is_none() {
            *slot = Some(kind);
        }
    }

    /// How the process completed, once it has.
    pub fn kind(&self) -> Option<CompletionKind> {
        *lock(&self.0)
    }

    pub fn is_done(&self) -> bool {
        self.kind().is_some()
    }
}

/// Handle to a spawned child.
#[derive(Clone)]
pub struct ChildHandle {
    pub pid: Pid,
    pub exit: ExitWatch,
}

/// Everything needed to start a process.
pub struct LaunchSpec {
    pub system: SystemId,
    pub user: String,
    pub parent_pid: Pid,
    pub line: String,
    pub origin: Origin,
    pub started_at: f64,
}

/// The runtime instance of a running executable.
pub struct Process {
    info: ProcessInfo,
    origin: Origin,
    task: Box<dyn Task>,
    completed: Option<CompletionKind>,
    /// Guards completion side effects so they fire exactly once
    cleaned: bool,
    exit: ExitWatch,
}

impl Process {
    /// Creates a process around an already-built task.
    pub fn new(info: ProcessInfo, origin: Origin, task: Box<dyn Task>) -> Self {
        Self {
            info,
            origin,
            task,
            completed: None,
            cleaned: false,
            exit: ExitWatch::default(),
        }
    }

    /// Resolves the command line against the system's programs, allocates a
    /// pid and instantiates the task.
    pub fn launch(
        systems: &mut SystemDirectory,
        registry: &ExecutableRegistry,
        spec: LaunchSpec,
    ) -> Result<Self, DispatchError> {
        let invocation = Invocation::parse(&spec.line)?;
        let system = systems
            .system_mut(spec.system)
            .ok_or_else(|| DispatchError::UnknownSystem(spec.system.to_string()))?;
        let executable = registry
            .resolve(system, &invocation.name)
            .ok_or_else(|| DispatchError::CommandNotFound(invocation.name.clone()))?;

        // Factories are program code; a panicking one fails only this command
        let name = invocation.name.clone();
        let task = catch_unwind(AssertUnwindSafe(|| executable.instantiate(invocation))).map_err(|payload| {
            DispatchError::StartFailed {
                program: name.clone(),
                reason: panic_message(payload.as_ref()),
            }
        })?;

        let info = ProcessInfo {
            pid: system.allocate_pid(),
            parent_pid: spec.parent_pid,
            system: spec.system,
            user: spec.user,
            name,
            started_at: spec.started_at,
        };
        Ok(Self::new(info, spec.origin, task))
    }

    pub fn pid(&self) -> Pid {
        self.info.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.info.parent_pid
    }

    pub fn system(&self) -> SystemId {
        self.info.system
    }

    pub fn key(&self) -> ProcessKey {
        ProcessKey::new(self.info.system, self.info.pid)
    }

    pub fn info(&self) -> &ProcessInfo {
        &self.info
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn completed(&self) -> Option<CompletionKind> {
        self.completed
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_some()
    }

    /// Handle other tasks can wait on.
    pub fn handle(&self) -> ChildHandle {
        ChildHandle {
            pid: self.info.pid,
            exit: self.exit.clone(),
        }
    }

    pub(crate) fn task_mut(&mut self) -> &mut dyn Task {
        self.task.as_mut()
    }

    /// Asks the task whether it may be completed with `kind`.
    ///
    /// A panicking callback counts as consent.
    pub fn request_shutdown(&mut self, kind: CompletionKind) -> bool {
        if self.cleaned {
            return true;
        }
        let task = &mut self.task;
        let accepted = catch_unwind(AssertUnwindSafe(|| task.on_shutdown(kind))).unwrap_or(true);
        accepted || kind.is_forced()
    }

    /// Completes the process. Idempotent: only the first call has effects.
    ///
    /// # Returns
    /// `true` if this call performed the completion.
    pub fn complete(&mut self, kind: CompletionKind, systems: &mut SystemDirectory) -> bool {
        if self.cleaned {
            return false;
        }
        self.cleaned = true;
        self.completed = Some(kind);

        let operation_id = self.origin.operation_id;
        if kind.is_kill() {
            self.origin.context.write_event(OutputEvent::ProcessTerminated {
                operation_id,
                pid: self.info.pid,
            });
        }

        let mut cx = CompletionContext {
            systems,
            origin: &self.origin,
            pid: self.info.pid,
            system: self.info.system,
        };
        let task = &mut self.task;
        if catch_unwind(AssertUnwindSafe(|| task.on_complete(kind, &mut cx))).is_err() {
            warn!(pid = self.info.pid, system = %self.info.system, "completion callback panicked");
        }

        if self.origin.owns_operation {
            self.origin
                .context
                .write_event(OutputEvent::OperationComplete { operation_id });
        }
        self.exit.set(kind);

        if let Err(e) = self.origin.context.flush() {
            debug!(pid = self.info.pid, "flush after completion failed: {}", e);
        }
        true
    }
}

/// All live processes of a World, keyed by `(system, pid)`.
#[derive(Default)]
pub struct ProcessTable {
    operations: BTreeMap<ProcessKey, Operation>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an operation under its process key.
    pub fn insert(&mut self, operation: Operation) {
        self.operations.insert(operation.key(), operation);
    }

    pub fn remove(&mut self, key: &ProcessKey) -> Option<Operation> {
        self.operations.remove(key)
    }

    pub fn get(&self, key: &ProcessKey) -> Option<&Operation> {
        self.operations.get(key)
    }

    pub fn contains(&self, key: &ProcessKey) -> bool {
        self.operations.contains_key(key)
    }

    /// Snapshot of the current keys, in stable order.
    pub fn keys(&self) -> Vec<ProcessKey> {
        self.operations.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.values()
    }

    /// Descriptions of the processes on `system`.
    pub fn infos_on(&self, system: SystemId) -> Vec<ProcessInfo> {
        self.operations
            .values()
            .map(|op| op.process().info())
            .filter(|info| info.system == system)
            .cloned()
            .collect()
    }

    /// Direct children of `parent` currently in the table.
    pub fn children_of(&self, parent: ProcessKey) -> Vec<ProcessKey> {
        self.operations
            .iter()
            .filter(|(key, op)| {
                key.system == parent.system
                    && op.process().parent_pid() == parent.pid
                    && key.pid != parent.pid
            })
            .map(|(key, _)| *key)
            .collect()
    }

    /// Descendants of `root` in post-order (children before parents),
    /// ending with `root` itself.
    pub fn post_order(&self, root: ProcessKey) -> Vec<ProcessKey> {
        let mut order = Vec::new();
        let mut visited = BTreeSet::new();
        self.visit(root, &mut visited, &mut order);
        order
    }

    fn visit(&self, key: ProcessKey, visited: &mut BTreeSet<ProcessKey>, order: &mut Vec<ProcessKey>) {
        if !visited.insert(key) {
            return;
        }
        for child in self.children_of(key) {
            self.visit(child, visited, order);
        }
        order.push(key);
    }

    /// Completes `target` and every transitive child, children first.
    ///
    /// All processes are asked first; a single veto fails the whole cascade
    /// and nothing is completed.
    ///
    /// # Returns
    /// The completed pids, in completion order.
    pub fn complete_recurse(
        &mut self,
        target: ProcessKey,
        kind: CompletionKind,
        systems: &mut SystemDirectory,
    ) -> Result<Vec<Pid>, KillError> {
        if !self.contains(&target) {
            return Err(KillError::NoSuchProcess {
                system: target.system,
                pid: target.pid,
            });
        }

        let order = self.post_order(target);
        for key in &order {
            if let Some(op) = self.operations.get_mut(key) {
                if !op.process_mut().request_shutdown(kind) {
                    warn!(pid = key.pid, system = %key.system, ?kind, "process vetoed shutdown");
                    return Err(KillError::Vetoed { pid: key.pid });
                }
            }
        }

        let mut completed = Vec::with_capacity(order.len());
        for key in order {
            if let Some(mut op) = self.operations.remove(&key) {
                op.process_mut().complete(kind, systems);
                completed.push(key.pid);
            }
        }
        Ok(completed)
    }

    /// Force-completes the children of a process that has already left the
    /// table (orphans cannot outlive their parent).
    pub fn complete_orphans(&mut self, parent: ProcessKey, systems: &mut SystemDirectory) -> Vec<Pid> {
        let mut completed = Vec::new();
        for child in self.children_of(parent) {
            if let Ok(pids) = self.complete_recurse(child, CompletionKind::KillRemote, systems) {
                completed.extend(pids);
            }
        }
        completed
    }
}
