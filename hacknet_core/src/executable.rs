//! Executables and the step-generator contract.
//!
//! An [`Executable`] is a factory: each dispatch calls
//! [`Executable::instantiate`] to build a fresh [`Task`], the suspended body
//! of one process. A task is advanced one [`Step`] at a time by its
//! [`Operation`](crate::Operation); the code between two yields runs
//! atomically with respect to World state.

use crate::error::{DispatchError, TaskError};
use crate::operation::Operation;
use crate::process::{ChildHandle, CompletionKind, LaunchSpec, Origin, Process, ProcessInfo, ProcessKey, ProcessTable};
use crate::queue::{CommandQueue, KillTicket};
use crate::system::{Login, SystemDirectory, VirtualSystem};
use crate::yield_token::YieldToken;

use hacknet_env::{OperationId, OutputEvent, PersonContext, Pid, SystemId, WorldId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of advancing a task by one step.
#[derive(Debug)]
pub enum Step {
    /// Suspend until the token resumes; `None` suspends for exactly one tick
    Yield(Option<YieldToken>),

    /// The task finished naturally
    Done,
}

impl Step {
    /// Suspends for exactly one tick.
    pub fn tick() -> Self {
        Step::Yield(None)
    }

    /// Suspends until `token` resumes.
    pub fn wait(token: YieldToken) -> Self {
        Step::Yield(Some(token))
    }
}

/// The suspended body of one running process.
pub trait Task: Send {
    /// Runs the code up to the next yield point.
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError>;

    /// Shutdown callback consulted before a non-natural completion.
    ///
    /// Returning `false` vetoes the shutdown (e.g. a service still flushing
    /// state). `KillRemote` completions ignore the veto.
    fn on_shutdown(&mut self, _kind: CompletionKind) -> bool {
        true
    }

    /// Cleanup run exactly once when the process completes.
    fn on_complete(&mut self, _kind: CompletionKind, _cx: &mut CompletionContext<'_>) {}
}

/// Arguments handed to an executable when it is instantiated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name (first word of the command line)
    pub name: String,

    /// Remaining words
    pub args: Vec<String>,

    /// The full command line as typed
    pub line: String,
}

impl Invocation {
    /// Splits a command line into program name and arguments.
    pub fn parse(line: &str) -> Result<Self, DispatchError> {
        let mut words = line.split_whitespace().map(str::to_string);
        let name = words.next().ok_or(DispatchError::EmptyCommand)?;
        Ok(Self {
            name,
            args: words.collect(),
            line: line.trim().to_string(),
        })
    }
}

/// A program that can be started as a process.
pub trait Executable: Send + Sync {
    /// Name the program is invoked by.
    fn name(&self) -> &str;

    /// Builds a fresh task body for one invocation.
    fn instantiate(&self, invocation: Invocation) -> Box<dyn Task>;
}

/// Shared handle to an executable, as returned by the registry.
pub type ExecutableFactory = Arc<dyn Executable>;

type FactoryFn = dyn Fn(Invocation) -> Box<dyn Task> + Send + Sync;

/// Executable backed by a closure.
pub struct FnExecutable {
    name: String,
    factory: Box<FactoryFn>,
}

impl FnExecutable {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Invocation) -> Box<dyn Task> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Box::new(factory),
        }
    }
}

impl Executable for FnExecutable {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, invocation: Invocation) -> Box<dyn Task> {
        (self.factory)(invocation)
    }
}

/// Task backed by a step closure.
pub struct FnTask<F>(F);

impl<F> Task for FnTask<F>
where
    F: FnMut(&mut StepContext<'_>) -> Result<Step, TaskError> + Send,
{
    fn step(&mut self, cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
        (self.0)(cx)
    }
}

/// Boxes a step closure as a task.
pub fn task_fn<F>(step: F) -> Box<dyn Task>
where
    F: FnMut(&mut StepContext<'_>) -> Result<Step, TaskError> + Send + 'static,
{
    Box::new(FnTask(step))
}

/// Registry of installed executables, built once at startup and shared.
#[derive(Default)]
pub struct ExecutableRegistry {
    programs: BTreeMap<String, ExecutableFactory>,
}

impl ExecutableRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an executable under its own name, replacing any previous one.
    pub fn register(&mut self, executable: ExecutableFactory) {
        self.programs.insert(executable.name().to_string(), executable);
    }

    /// Registers a closure-backed executable.
    pub fn register_fn<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(Invocation) -> Box<dyn Task> + Send + Sync + 'static,
    {
        self.register(Arc::new(FnExecutable::new(name, factory)));
    }

    /// Looks up `name` among the programs available on `system`.
    pub fn resolve(&self, system: &VirtualSystem, name: &str) -> Option<ExecutableFactory> {
        if !system.has_program(name) {
            return None;
        }
        self.programs.get(name).cloned()
    }

    /// Names of all registered programs.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

/// Everything a task may touch while one of its steps runs.
///
/// Steps run on the tick thread with exclusive access to the World's
/// systems; other processes are visible read-only.
pub struct StepContext<'a> {
    pub(crate) world: WorldId,
    pub(crate) time: f64,
    pub(crate) delta: f64,
    pub(crate) me: ProcessInfo,
    pub(crate) origin: Origin,
    pub(crate) systems: &'a mut SystemDirectory,
    pub(crate) table: &'a ProcessTable,
    pub(crate) registry: &'a ExecutableRegistry,
    pub(crate) queue: &'a Arc<CommandQueue>,
    pub(crate) spawned: &'a mut Vec<Operation>,
}

impl<'a> StepContext<'a> {
    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Current simulated time in seconds.
    pub fn time(&self) -> f64 {
        self.time
    }

    /// Simulated time elapsed during this tick.
    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn pid(&self) -> Pid {
        self.me.pid
    }

    pub fn parent_pid(&self) -> Pid {
        self.me.parent_pid
    }

    pub fn system_id(&self) -> SystemId {
        self.me.system
    }

    pub fn user(&self) -> &str {
        &self.me.user
    }

    pub fn operation_id(&self) -> OperationId {
        self.origin.operation_id
    }

    /// The person context this process reports to.
    pub fn context(&self) -> &Arc<dyn PersonContext> {
        &self.origin.context
    }

    /// Writes one line of output.
    pub fn print(&self, text: impl Into<String>) {
        self.origin.context.write_event(OutputEvent::Output {
            operation_id: self.origin.operation_id,
            text: text.into(),
        });
    }

    /// Writes an error line.
    pub fn error(&self, message: impl Into<String>) {
        self.origin.context.write_event(OutputEvent::Error {
            operation_id: self.origin.operation_id,
            message: message.into(),
        });
    }

    /// Announces that input is expected for this operation.
    pub fn prompt(&self, prompt: impl Into<String>) {
        self.origin.context.write_event(OutputEvent::Prompt {
            operation_id: self.origin.operation_id,
            prompt: prompt.into(),
        });
    }

    /// Builds an `Input` token for this operation.
    pub fn input_token(&self) -> (YieldToken, crate::yield_token::InputSlot) {
        YieldToken::input(self.origin.context.clone(), self.origin.operation_id)
    }

    /// Key under which a client answers this operation's confirmation.
    pub fn confirm_key(&self) -> String {
        format!("confirm:{}", self.origin.operation_id.0)
    }

    /// Builds a token waiting for the response to [`confirm_key`](Self::confirm_key).
    pub fn response_token(&self) -> (YieldToken, crate::yield_token::InputSlot) {
        YieldToken::response(self.origin.context.clone(), self.confirm_key())
    }

    /// The system this process runs on.
    pub fn system(&self) -> Option<&VirtualSystem> {
        self.systems.system(self.me.system)
    }

    pub fn system_mut(&mut self) -> Option<&mut VirtualSystem> {
        self.systems.system_mut(self.me.system)
    }

    /// The origin context's login on this process's system.
    pub fn login(&self) -> Option<&Login> {
        self.systems.login_for(self.origin.context.id(), self.me.system)
    }

    pub fn login_mut(&mut self) -> Option<&mut Login> {
        self.systems.login_for_mut(self.origin.context.id(), self.me.system)
    }

    /// Processes on this process's system, including the caller, by pid.
    pub fn processes(&self) -> Vec<ProcessInfo> {
        let mut infos = self.table.infos_on(self.me.system);
        infos.push(self.me.clone());
        infos.sort_by_key(|info| info.pid);
        infos
    }

    /// Starts a child process on this system.
    ///
    /// The child is registered after this step returns and takes its first
    /// step on the next tick. Its output goes to this operation.
    pub fn spawn(&mut self, line: &str) -> Result<ChildHandle, DispatchError> {
        let spec = LaunchSpec {
            system: self.me.system,
            user: self.me.user.clone(),
            parent_pid: self.me.pid,
            line: line.to_string(),
            origin: Origin {
                context: self.origin.context.clone(),
                operation_id: self.origin.operation_id,
                owns_operation: false,
            },
            started_at: self.time,
        };
        let process = Process::launch(self.systems, self.registry, spec)?;
        let handle = process.handle();
        self.spawned.push(Operation::new(process));
        Ok(handle)
    }

    /// Exit handle of a live process on this system.
    pub fn watch(&self, pid: Pid) -> Option<ChildHandle> {
        if pid == self.me.pid {
            return None;
        }
        self.table
            .get(&ProcessKey::new(self.me.system, pid))
            .map(|op| op.process().handle())
    }

    /// Builds a token that queues a kill of `pid` on this system when first
    /// polled and resumes once dispatch has decided it.
    ///
    /// Kills never run inside a step; the request is executed during the
    /// dispatch phase of a later tick.
    pub fn kill_token(&self, pid: Pid, kind: CompletionKind) -> (YieldToken, KillTicket) {
        let ticket = KillTicket::default();
        let queue = Arc::clone(self.queue);
        let world = self.world;
        let context = self.origin.context.clone();
        let operation_id = self.origin.operation_id;
        let system = self.me.system;
        let request = ticket.clone();
        let decided = ticket.clone();

        let token = YieldToken::act_wait(
            move || queue.enqueue_kill(world, context, operation_id, Some(system), pid, kind, Some(request)),
            YieldToken::condition(move || decided.is_resolved()),
        );
        (token, ticket)
    }
}

/// What a task may touch while it is being completed.
pub struct CompletionContext<'a> {
    pub(crate) systems: &'a mut SystemDirectory,
    pub(crate) origin: &'a Origin,
    pub(crate) pid: Pid,
    pub(crate) system: SystemId,
}

impl<'a> CompletionContext<'a> {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn system_id(&self) -> SystemId {
        self.system
    }

    pub fn context(&self) -> &Arc<dyn PersonContext> {
        &self.origin.context
    }

    pub fn systems_mut(&mut self) -> &mut SystemDirectory {
        self.systems
    }

    pub fn write_event(&self, event: OutputEvent) {
        self.origin.context.write_event(event);
    }
}
