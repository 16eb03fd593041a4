//! World - one tenant's simulated network and its tick.
//!
//! A tick runs in fixed phases:
//! 1. Dispatch the batch drained from the ingestion queue (commands, kills, logins)
//! 2. Advance simulated time by the elapsed wall time
//! 3. Update every operation once, over a snapshot of the table
//! 4. Register processes spawned during the updates
//! 5. Complete finished operations, children first
//! 6. Run plugins
//!
//! Commands dispatched in phase 1 take their first step in phase 3 of the
//! same tick. Anything enqueued during phases 3 to 6 waits for the next tick.

use crate::error::{DispatchError, KillError};
use crate::executable::{ExecutableRegistry, StepContext};
use crate::operation::Operation;
use crate::persistence::WorldSnapshot;
use crate::plugin::{PluginContext, WorldPlugin};
use crate::process::{CompletionKind, LaunchSpec, Origin, Process, ProcessKey, ProcessTable};
use crate::queue::{CommandQueue, KillTicket, QueuedCommand, QueuedRequest};
use crate::system::SystemDirectory;

use hacknet_env::{ContextId, OperationId, OutputEvent, PersonContext, Pid, SystemId, WorldId};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Program started for every login.
pub const LOGIN_SHELL: &str = "shell";

/// Counters describing what a World has done since it was created.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorldStats {
    pub ticks: u64,

    /// Processes created from queued commands and logins
    pub dispatched: u64,

    /// Commands naming a program the system does not have
    pub not_found: u64,

    /// Other dispatch failures (not logged in, permission, ...)
    pub rejected: u64,

    /// Processes completed, by any path
    pub completed: u64,

    /// Steps that returned an error or panicked
    pub failed: u64,

    /// Kill requests refused by a veto
    pub vetoes: u64,
}

/// One tenant's simulated network.
pub struct World {
    id: WorldId,
    name: String,

    /// Simulated seconds since the World was first created
    time: f64,
    previous_time: f64,

    systems: SystemDirectory,
    operations: ProcessTable,
    registry: Arc<ExecutableRegistry>,

    /// Queue shared with the network front end and the tick driver
    queue: Arc<CommandQueue>,

    plugins: Vec<Box<dyn WorldPlugin>>,
    stats: WorldStats,
}

impl World {
    pub fn new(
        id: WorldId,
        name: impl Into<String>,
        systems: SystemDirectory,
        registry: Arc<ExecutableRegistry>,
        queue: Arc<CommandQueue>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            time: 0.0,
            previous_time: 0.0,
            systems,
            operations: ProcessTable::new(),
            registry,
            queue,
            plugins: Vec::new(),
            stats: WorldStats::default(),
        }
    }

    /// Rebuilds a World from persisted state. No process survives a restart.
    pub fn from_snapshot(snapshot: WorldSnapshot, registry: Arc<ExecutableRegistry>, queue: Arc<CommandQueue>) -> Self {
        let mut world = Self::new(
            snapshot.id,
            snapshot.name,
            SystemDirectory::from_systems(snapshot.systems),
            registry,
            queue,
        );
        world.time = snapshot.time;
        world.previous_time = snapshot.time;
        world
    }

    /// Captures the persistent part of this World.
    pub fn snapshot(&self) -> WorldSnapshot {
        WorldSnapshot {
            id: self.id,
            name: self.name.clone(),
            time: self.time,
            systems: self.systems.snapshot(),
        }
    }

    pub fn id(&self) -> WorldId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn previous_time(&self) -> f64 {
        self.previous_time
    }

    pub fn systems(&self) -> &SystemDirectory {
        &self.systems
    }

    pub fn systems_mut(&mut self) -> &mut SystemDirectory {
        &mut self.systems
    }

    pub fn operations(&self) -> &ProcessTable {
        &self.operations
    }

    pub fn queue(&self) -> &Arc<CommandQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &WorldStats {
        &self.stats
    }

    /// Appends a plugin; plugins run in registration order.
    pub fn add_plugin(&mut self, plugin: Box<dyn WorldPlugin>) {
        info!(world = %self.id, plugin = plugin.name(), "plugin registered");
        self.plugins.push(plugin);
    }

    /// Runs one tick.
    ///
    /// # Arguments
    /// * `batch` - entries drained from the queue for this World, in arrival order
    /// * `elapsed` - wall-clock seconds since the previous tick
    pub fn tick(&mut self, batch: Vec<QueuedCommand>, elapsed: f64) {
        self.stats.ticks += 1;

        for command in batch {
            self.dispatch(command);
        }

        self.previous_time = self.time;
        if elapsed > 0.0 && elapsed.is_finite() {
            self.time += elapsed;
        }
        let delta = self.time - self.previous_time;

        let mut spawned = Vec::new();
        let mut finished = Vec::new();
        for key in self.operations.keys() {
            let Some(mut op) = self.operations.remove(&key) else {
                continue;
            };
            let done = {
                let mut cx = StepContext {
                    world: self.id,
                    time: self.time,
                    delta,
                    me: op.process().info().clone(),
                    origin: op.process().origin().clone(),
                    systems: &mut self.systems,
                    table: &self.operations,
                    registry: &self.registry,
                    queue: &self.queue,
                    spawned: &mut spawned,
                };
                op.update(&mut cx)
            };
            if done {
                finished.push(op);
            } else {
                self.operations.insert(op);
            }
        }

        for op in spawned {
            debug!(world = %self.id, pid = op.process().pid(), name = %op.process().info().name, "child registered");
            self.stats.dispatched += 1;
            self.operations.insert(op);
        }

        for mut op in children_first(finished) {
            let key = op.key();
            let orphans = self.operations.complete_orphans(key, &mut self.systems);
            self.stats.completed += orphans.len() as u64;

            let kind = op.completion_kind();
            if op.failure().is_some() {
                self.stats.failed += 1;
            }
            if op.process_mut().complete(kind, &mut self.systems) {
                self.stats.completed += 1;
            }
        }

        self.run_plugins(delta);
    }

    fn run_plugins(&mut self, delta: f64) {
        if self.plugins.is_empty() {
            return;
        }
        let mut cx = PluginContext {
            world: self.id,
            time: self.time,
            delta,
            systems: &self.systems,
            queue: &self.queue,
            processes: self.operations.len(),
        };
        for plugin in &mut self.plugins {
            if catch_unwind(AssertUnwindSafe(|| plugin.tick(&mut cx))).is_err() {
                warn!(world = %self.id, plugin = plugin.name(), "plugin tick panicked");
            }
        }
    }

    fn dispatch(&mut self, command: QueuedCommand) {
        if command.world != self.id {
            warn!(world = %self.id, target = %command.world, "dropping command for another world");
            return;
        }

        let QueuedCommand {
            context,
            operation_id,
            request,
            ..
        } = command;
        let result = match request {
            QueuedRequest::Command { line } => self.dispatch_command(&context, operation_id, &line),
            QueuedRequest::Login { hostname, user } => self.dispatch_login(&context, operation_id, &hostname, &user),
            QueuedRequest::Kill {
                system,
                pid,
                kind,
                ticket,
            } => {
                self.dispatch_kill(&context, operation_id, system, pid, kind, ticket);
                Ok(())
            }
            QueuedRequest::Disconnect => {
                self.dispatch_disconnect(&context);
                Ok(())
            }
        };

        if let Err(e) = result {
            match e {
                DispatchError::CommandNotFound(_) => self.stats.not_found += 1,
                _ => self.stats.rejected += 1,
            }
            debug!(world = %self.id, context = %context.id(), %operation_id, "dispatch failed: {}", e);
            context.write_event(OutputEvent::Error {
                operation_id,
                message: e.to_string(),
            });
            context.write_event(OutputEvent::OperationComplete { operation_id });
            if let Err(e) = context.flush() {
                debug!(context = %context.id(), "flush failed: {}", e);
            }
        }
    }

    fn dispatch_command(
        &mut self,
        context: &Arc<dyn PersonContext>,
        operation_id: OperationId,
        line: &str,
    ) -> Result<(), DispatchError> {
        let (system, login) = self.systems.current_system_and_login(context.id())?;
        let spec = LaunchSpec {
            system: system.id,
            user: login.user.clone(),
            parent_pid: login.shell.unwrap_or(0),
            line: line.to_string(),
            origin: Origin {
                context: context.clone(),
                operation_id,
                owns_operation: true,
            },
            started_at: self.time,
        };

        let process = Process::launch(&mut self.systems, &self.registry, spec)?;
        debug!(
            world = %self.id,
            system = %process.system(),
            pid = process.pid(),
            %operation_id,
            "dispatched {}",
            line
        );
        self.stats.dispatched += 1;
        self.operations.insert(Operation::new(process));
        Ok(())
    }

    fn dispatch_login(
        &mut self,
        context: &Arc<dyn PersonContext>,
        operation_id: OperationId,
        hostname: &str,
        user: &str,
    ) -> Result<(), DispatchError> {
        let mut login = self.systems.authenticate(hostname, user)?;
        let spec = LaunchSpec {
            system: login.system,
            user: login.user.clone(),
            parent_pid: 0,
            line: LOGIN_SHELL.to_string(),
            origin: Origin {
                context: context.clone(),
                operation_id,
                owns_operation: true,
            },
            started_at: self.time,
        };
        let shell = Process::launch(&mut self.systems, &self.registry, spec)?;

        info!(world = %self.id, context = %context.id(), hostname, user, pid = shell.pid(), "login");
        login.shell = Some(shell.pid());
        context.write_event(OutputEvent::Bind {
            system: login.system,
            hostname: hostname.to_string(),
            user: login.user.clone(),
        });
        self.systems.bind_login(context.id(), login);
        self.stats.dispatched += 1;
        self.operations.insert(Operation::new(shell));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_kill(
        &mut self,
        context: &Arc<dyn PersonContext>,
        operation_id: OperationId,
        system: Option<SystemId>,
        pid: Pid,
        kind: CompletionKind,
        ticket: Option<KillTicket>,
    ) {
        let outcome = self
            .authorize_kill(context.id(), system, pid)
            .and_then(|key| self.kill(key, kind));

        match ticket {
            Some(ticket) => ticket.resolve(outcome),
            None => {
                if let Err(e) = &outcome {
                    context.write_event(OutputEvent::Error {
                        operation_id,
                        message: e.to_string(),
                    });
                }
                context.write_event(OutputEvent::OperationComplete { operation_id });
                if let Err(e) = context.flush() {
                    debug!(context = %context.id(), "flush failed: {}", e);
                }
            }
        }
    }

    /// Force-completes the shells of every login of `context`, innermost
    /// first, then drops whatever logins remain.
    fn dispatch_disconnect(&mut self, context: &Arc<dyn PersonContext>) {
        let shells: Vec<ProcessKey> = self
            .systems
            .logins(context.id())
            .iter()
            .rev()
            .filter_map(|login| login.shell.map(|pid| ProcessKey::new(login.system, pid)))
            .collect();

        let mut completed = 0;
        for key in shells {
            if !self.operations.contains(&key) {
                continue;
            }
            if let Ok(pids) = self.kill(key, CompletionKind::KillRemote) {
                completed += pids.len();
            }
        }
        let dropped = self.systems.clear_logins(context.id());
        info!(world = %self.id, context = %context.id(), completed, dropped = dropped.len(), "context disconnected");
    }

    /// Checks that `context` may kill `pid`: admins may kill anything on
    /// their system, other users only their own processes.
    fn authorize_kill(
        &self,
        context: ContextId,
        system: Option<SystemId>,
        pid: Pid,
    ) -> Result<ProcessKey, KillError> {
        let login = match system {
            Some(system) => self.systems.login_for(context, system),
            None => self.systems.current_login(context),
        }
        .ok_or(DispatchError::NotLoggedIn)?;

        let key = ProcessKey::new(login.system, pid);
        let op = self.operations.get(&key).ok_or(KillError::NoSuchProcess {
            system: login.system,
            pid,
        })?;
        if !login.admin && op.process().info().user != login.user {
            return Err(DispatchError::PermissionDenied(format!("kill {}", pid)).into());
        }
        Ok(key)
    }

    /// Completes `target` and its descendants with `kind`.
    ///
    /// # Returns
    /// The completed pids, children first, or the reason nothing was completed.
    pub fn kill(&mut self, target: ProcessKey, kind: CompletionKind) -> Result<Vec<Pid>, KillError> {
        match self.operations.complete_recurse(target, kind, &mut self.systems) {
            Ok(pids) => {
                info!(world = %self.id, system = %target.system, pid = target.pid, ?kind, count = pids.len(), "killed");
                self.stats.completed += pids.len() as u64;
                Ok(pids)
            }
            Err(e) => {
                if matches!(e, KillError::Vetoed { .. }) {
                    self.stats.vetoes += 1;
                }
                Err(e)
            }
        }
    }

    /// Force-completes every process on `system`, as when the machine reboots.
    pub fn reboot_system(&mut self, system: SystemId) -> Vec<Pid> {
        let pids = self.force_complete(|key| key.system == system);
        info!(world = %self.id, %system, count = pids.len(), "system rebooted");
        pids
    }

    /// Force-completes every process in the World.
    pub fn shutdown(&mut self) -> usize {
        let pids = self.force_complete(|_| true);
        info!(world = %self.id, count = pids.len(), "world shut down");
        pids.len()
    }

    fn force_complete(&mut self, selected: impl Fn(&ProcessKey) -> bool) -> Vec<Pid> {
        let mut completed = Vec::new();
        for key in self.operations.keys().into_iter().filter(|k| selected(k)) {
            if !self.operations.contains(&key) {
                continue;
            }
            // KillRemote ignores vetoes, so this cannot fail
            if let Ok(pids) = self.kill(key, CompletionKind::KillRemote) {
                completed.extend(pids);
            }
        }
        completed
    }
}

/// Orders finished operations so every child completes before its parent.
fn children_first(mut finished: Vec<Operation>) -> Vec<Operation> {
    let mut ordered = Vec::with_capacity(finished.len());
    while !finished.is_empty() {
        let idx = finished
            .iter()
            .position(|op| {
                !finished.iter().any(|other| {
                    other.key() != op.key()
                        && other.process().system() == op.process().system()
                        && other.process().parent_pid() == op.process().pid()
                })
            })
            .unwrap_or(0);
        ordered.push(finished.remove(idx));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::executable::{task_fn, Step, Task};
    use crate::system::VirtualSystem;
    use crate::yield_token::YieldToken;
    use hacknet_env::SessionContext;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HOME: SystemId = SystemId(1);

    struct Fixture {
        world: World,
        queue: Arc<CommandQueue>,
        ctx: Arc<SessionContext>,
    }

    impl Fixture {
        fn new(registry: ExecutableRegistry) -> Self {
            let mut system = VirtualSystem::new(HOME, "localhost").with_account("user", false);
            system.fs.write("/home/user/a.txt", "a").unwrap();
            system.fs.write("/home/user/b.txt", "b").unwrap();
            let mut systems = SystemDirectory::new();
            systems.insert(system);

            let queue = Arc::new(CommandQueue::new());
            let world = World::new(WorldId(0), "test", systems, Arc::new(registry), queue.clone());
            Self {
                world,
                queue,
                ctx: Arc::new(SessionContext::new(ContextId::from_seed(1))),
            }
        }

        fn context(&self) -> Arc<dyn PersonContext> {
            self.ctx.clone()
        }

        fn login(&mut self, user: &str) {
            self.queue.enqueue_login(WorldId(0), self.context(), OperationId(0), "localhost", user);
            self.tick(0.0);
            self.ctx.take_delivered();
        }

        fn run(&mut self, op: u64, line: &str) {
            self.queue.enqueue(WorldId(0), self.context(), OperationId(op), line);
        }

        fn tick(&mut self, elapsed: f64) {
            let mut batch = Vec::new();
            self.queue.drain_into(&mut batch);
            self.world.tick(batch, elapsed);
        }
    }

    /// Shell stand-in that idles until killed.
    fn idle_shell(registry: &mut ExecutableRegistry) {
        registry.register_fn(LOGIN_SHELL, |_| task_fn(|_| Ok(Step::tick())));
    }

    fn ls_registry() -> ExecutableRegistry {
        let mut registry = ExecutableRegistry::new();
        idle_shell(&mut registry);
        registry.register_fn("ls", |_| {
            task_fn(|cx| {
                let cwd = cx.login().map(|l| l.cwd.clone()).unwrap_or_else(|| "/".to_string());
                let names = cx
                    .system()
                    .ok_or_else(|| TaskError::failed("no system"))?
                    .fs
                    .list(&cwd)
                    .map_err(|e| TaskError::failed(e.to_string()))?;
                for name in names {
                    cx.print(name);
                }
                Ok(Step::Done)
            })
        });
        registry
    }

    #[test]
    fn test_ls_lists_home_in_one_tick() {
        let mut f = Fixture::new(ls_registry());
        f.login("user");

        f.run(7, "ls");
        f.tick(0.01);

        let events = f.ctx.take_delivered();
        let texts: Vec<&str> = events.iter().filter_map(OutputEvent::as_output).collect();
        assert_eq!(texts, vec!["a.txt", "b.txt"]);
        assert_eq!(
            events.last(),
            Some(&OutputEvent::OperationComplete { operation_id: OperationId(7) })
        );
        // Only the shell is left
        assert_eq!(f.world.operations().len(), 1);
    }

    #[test]
    fn test_delay_prints_after_cumulative_time() {
        let mut registry = ls_registry();
        registry.register_fn("wait5", |_| {
            let mut waited = false;
            task_fn(move |cx| {
                if !waited {
                    waited = true;
                    return Ok(Step::wait(YieldToken::delay(5.0)));
                }
                cx.print("done");
                Ok(Step::Done)
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(1, "wait5");
        f.tick(0.0);
        f.tick(2.0);
        f.tick(2.0);
        assert!(f.ctx.take_delivered().iter().all(|e| e.as_output() != Some("done")));

        f.tick(2.0);
        let events = f.ctx.take_delivered();
        assert_eq!(events[0].as_output(), Some("done"));
        assert_eq!(f.world.time(), 6.0);
        assert_eq!(f.world.previous_time(), 4.0);
    }

    #[test]
    fn test_command_runs_first_step_same_tick() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let mut registry = ls_registry();
        registry.register_fn("count", move |_| {
            let counter = counter.clone();
            task_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Step::tick())
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(1, "count");
        f.tick(0.0);
        assert_eq!(steps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_command_not_found_creates_no_process() {
        let mut f = Fixture::new(ls_registry());
        f.login("user");

        f.run(3, "nmap 10.0.0.1");
        f.tick(0.0);

        assert_eq!(
            f.ctx.take_delivered(),
            vec![
                OutputEvent::Error {
                    operation_id: OperationId(3),
                    message: "nmap: command not found".to_string(),
                },
                OutputEvent::OperationComplete { operation_id: OperationId(3) },
            ]
        );
        assert_eq!(f.world.operations().len(), 1);
        assert_eq!(f.world.stats().not_found, 1);
    }

    #[test]
    fn test_panicking_factory_fails_only_its_command() {
        let mut registry = ls_registry();
        registry.register_fn("broken", |_| panic!("no task for you"));
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(1, "broken");
        f.run(2, "ls");
        f.tick(0.0);

        let events = f.ctx.take_delivered();
        assert_eq!(
            &events[..2],
            &[
                OutputEvent::Error {
                    operation_id: OperationId(1),
                    message: "broken: failed to start: no task for you".to_string(),
                },
                OutputEvent::OperationComplete { operation_id: OperationId(1) },
            ]
        );
        // The rest of the batch still ran
        let texts: Vec<&str> = events.iter().filter_map(OutputEvent::as_output).collect();
        assert_eq!(texts, vec!["a.txt", "b.txt"]);
        assert_eq!(f.world.stats().rejected, 1);
        assert_eq!(f.world.operations().len(), 1);
        // No pid was spent on the failed start: shell is 1, ls was 2
        assert_eq!(f.world.systems().system(HOME).unwrap().clone().allocate_pid(), 3);
    }

    #[test]
    fn test_not_logged_in_is_reported() {
        let mut f = Fixture::new(ls_registry());
        f.run(2, "ls");
        f.tick(0.0);

        let events = f.ctx.take_delivered();
        assert_eq!(
            events[0],
            OutputEvent::Error {
                operation_id: OperationId(2),
                message: "not logged in".to_string(),
            }
        );
        assert!(f.world.operations().is_empty());
        assert_eq!(f.world.stats().rejected, 1);
    }

    #[test]
    fn test_login_binds_and_starts_shell() {
        let mut f = Fixture::new(ls_registry());
        f.queue.enqueue_login(WorldId(0), f.context(), OperationId(0), "localhost", "user");
        f.tick(0.0);

        assert_eq!(
            f.ctx.take_delivered(),
            vec![OutputEvent::Bind {
                system: HOME,
                hostname: "localhost".to_string(),
                user: "user".to_string(),
            }]
        );
        let login = f.world.systems().current_login(f.ctx.id()).unwrap();
        assert_eq!(login.shell, Some(1));
        assert_eq!(login.cwd, "/home/user");
    }

    #[test]
    fn test_kill_shell_cascades_child_first() {
        let mut registry = ls_registry();
        registry.register_fn("sleep", |_| task_fn(|_| Ok(Step::wait(YieldToken::condition(|| false)))));
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(5, "sleep");
        f.tick(0.0);
        assert_eq!(f.world.operations().len(), 2);

        f.queue
            .enqueue_kill(WorldId(0), f.context(), OperationId(6), None, 1, CompletionKind::KillLocal, None);
        f.tick(0.0);

        assert_eq!(
            f.ctx.take_delivered(),
            vec![
                OutputEvent::ProcessTerminated { operation_id: OperationId(5), pid: 2 },
                OutputEvent::OperationComplete { operation_id: OperationId(5) },
                OutputEvent::ProcessTerminated { operation_id: OperationId(0), pid: 1 },
                OutputEvent::OperationComplete { operation_id: OperationId(0) },
                OutputEvent::OperationComplete { operation_id: OperationId(6) },
            ]
        );
        assert!(f.world.operations().is_empty());
    }

    struct Stubborn;

    impl Task for Stubborn {
        fn step(&mut self, _cx: &mut StepContext<'_>) -> Result<Step, TaskError> {
            Ok(Step::tick())
        }

        fn on_shutdown(&mut self, _kind: CompletionKind) -> bool {
            false
        }
    }

    #[test]
    fn test_vetoed_kill_reports_and_keeps_processes() {
        let mut registry = ls_registry();
        registry.register_fn("stubborn", |_| Box::new(Stubborn) as Box<dyn Task>);
        let mut f = Fixture::new(registry);
        f.login("user");
        f.run(1, "stubborn");
        f.tick(0.0);

        f.queue
            .enqueue_kill(WorldId(0), f.context(), OperationId(2), None, 2, CompletionKind::KillLocal, None);
        f.tick(0.0);

        assert_eq!(
            f.ctx.take_delivered(),
            vec![
                OutputEvent::Error {
                    operation_id: OperationId(2),
                    message: "process 2 did not terminate".to_string(),
                },
                OutputEvent::OperationComplete { operation_id: OperationId(2) },
            ]
        );
        assert_eq!(f.world.operations().len(), 2);
        assert_eq!(f.world.stats().vetoes, 1);

        // A forced kill goes through
        assert_eq!(f.world.kill(ProcessKey::new(HOME, 1), CompletionKind::KillRemote), Ok(vec![2, 1]));
    }

    #[test]
    fn test_kill_other_users_process_denied() {
        let mut registry = ls_registry();
        registry.register_fn("sleep", |_| task_fn(|_| Ok(Step::tick())));
        let mut f = Fixture::new(registry);
        f.login("user");

        // A second context logged in as root runs a process
        let root_ctx: Arc<dyn PersonContext> = Arc::new(SessionContext::new(ContextId::from_seed(2)));
        f.queue.enqueue_login(WorldId(0), root_ctx.clone(), OperationId(0), "localhost", "root");
        f.queue.enqueue(WorldId(0), root_ctx, OperationId(1), "sleep");
        f.tick(0.0);
        let root_pid = 3;
        assert!(f.world.operations().contains(&ProcessKey::new(HOME, root_pid)));

        f.queue.enqueue_kill(
            WorldId(0),
            f.context(),
            OperationId(9),
            None,
            root_pid,
            CompletionKind::KillLocal,
            None,
        );
        f.tick(0.0);
        assert!(matches!(
            f.ctx.take_delivered().first(),
            Some(OutputEvent::Error { message, .. }) if message == "permission denied: kill 3"
        ));
        assert!(f.world.operations().contains(&ProcessKey::new(HOME, root_pid)));
    }

    #[test]
    fn test_natural_parent_end_force_completes_orphans() {
        let mut registry = ls_registry();
        registry.register_fn("forever", |_| task_fn(|_| Ok(Step::tick())));
        registry.register_fn("parent", |_| {
            let mut started = false;
            task_fn(move |cx| {
                if started {
                    return Ok(Step::Done);
                }
                started = true;
                cx.spawn("forever").map_err(|e| TaskError::failed(e.to_string()))?;
                Ok(Step::tick())
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(4, "parent");
        f.tick(0.0);
        assert_eq!(f.world.operations().len(), 3);

        f.tick(0.0);
        let events = f.ctx.take_delivered();
        assert_eq!(
            events,
            vec![
                OutputEvent::ProcessTerminated { operation_id: OperationId(4), pid: 3 },
                OutputEvent::OperationComplete { operation_id: OperationId(4) },
            ]
        );
        assert_eq!(f.world.operations().len(), 1);
    }

    #[test]
    fn test_failing_step_does_not_stop_others() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let mut registry = ls_registry();
        registry.register_fn("crash", |_| task_fn(|_| panic!("corrupt state")));
        registry.register_fn("count", move |_| {
            let counter = counter.clone();
            task_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Step::tick())
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(1, "crash");
        f.run(2, "count");
        f.tick(0.0);
        f.tick(0.0);

        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(f.world.stats().failed, 1);
        let events = f.ctx.take_delivered();
        assert!(events.contains(&OutputEvent::ProcessTerminated { operation_id: OperationId(1), pid: 2 }));
        assert!(events.contains(&OutputEvent::OperationComplete { operation_id: OperationId(1) }));
    }

    #[test]
    fn test_panicking_wait_condition_is_contained() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let mut registry = ls_registry();
        registry.register_fn("badwait", |_| {
            task_fn(|_| Ok(Step::wait(YieldToken::condition(|| panic!("bad predicate")))))
        });
        registry.register_fn("count", move |_| {
            let counter = counter.clone();
            task_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Step::tick())
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");

        f.run(1, "badwait");
        f.run(2, "count");
        f.tick(0.0);
        f.ctx.take_delivered();
        f.tick(0.0);

        // badwait is gone; the shell and count are left
        assert_eq!(f.world.operations().len(), 2);
        assert!(!f.world.operations().contains(&ProcessKey::new(HOME, 2)));
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(f.world.stats().failed, 1);
        assert_eq!(
            f.ctx.take_delivered(),
            vec![
                OutputEvent::Error {
                    operation_id: OperationId(1),
                    message: "badwait: step panicked: bad predicate".to_string(),
                },
                OutputEvent::ProcessTerminated { operation_id: OperationId(1), pid: 2 },
                OutputEvent::OperationComplete { operation_id: OperationId(1) },
            ]
        );
    }

    #[test]
    fn test_reboot_force_completes_system() {
        let mut registry = ls_registry();
        registry.register_fn("stubborn", |_| Box::new(Stubborn) as Box<dyn Task>);
        let mut f = Fixture::new(registry);
        f.login("user");
        f.run(1, "stubborn");
        f.tick(0.0);

        let mut pids = f.world.reboot_system(HOME);
        pids.sort();
        assert_eq!(pids, vec![1, 2]);
        assert!(f.world.operations().is_empty());
    }

    #[test]
    fn test_disconnect_ends_shells_and_logins() {
        let mut registry = ls_registry();
        registry.register_fn("stubborn", |_| Box::new(Stubborn) as Box<dyn Task>);
        let mut f = Fixture::new(registry);
        f.login("user");
        f.run(1, "stubborn");
        f.tick(0.0);
        assert_eq!(f.world.operations().len(), 2);

        f.queue.enqueue_disconnect(WorldId(0), f.context());
        f.tick(0.0);

        assert!(f.world.operations().is_empty());
        assert!(f.world.systems().logins(f.ctx.id()).is_empty());
        assert_eq!(f.world.stats().rejected, 0);
    }

    #[test]
    fn test_snapshot_restores_time_and_files() {
        let mut f = Fixture::new(ls_registry());
        f.login("user");
        f.tick(3.5);

        let snapshot = f.world.snapshot();
        let restored = World::from_snapshot(snapshot, Arc::new(ls_registry()), Arc::new(CommandQueue::new()));
        assert_eq!(restored.time(), 3.5);
        assert!(restored.operations().is_empty());
        let system = restored.systems().system(HOME).unwrap();
        assert_eq!(system.fs.read("/home/user/a.txt"), Ok("a"));
        assert!(restored.systems().current_login(f.ctx.id()).is_none());
    }

    struct Recorder(Arc<AtomicUsize>);

    impl WorldPlugin for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn tick(&mut self, cx: &mut PluginContext<'_>) {
            self.0.store(cx.process_count(), Ordering::SeqCst);
        }
    }

    /// Enqueues one command line on its first tick.
    struct EnqueueOnce {
        context: Arc<dyn PersonContext>,
        fired: bool,
    }

    impl WorldPlugin for EnqueueOnce {
        fn name(&self) -> &str {
            "enqueue-once"
        }

        fn tick(&mut self, cx: &mut PluginContext<'_>) {
            if !self.fired {
                self.fired = true;
                cx.enqueue(self.context.clone(), OperationId(8), "echo x");
            }
        }
    }

    #[test]
    fn test_command_enqueued_during_tick_waits_for_next_tick() {
        let mut registry = ls_registry();
        registry.register_fn("echo", |inv| {
            let text = inv.args.join(" ");
            task_fn(move |cx| {
                cx.print(text.clone());
                Ok(Step::Done)
            })
        });
        let mut f = Fixture::new(registry);
        f.login("user");
        let context = f.context();
        f.world.add_plugin(Box::new(EnqueueOnce { context, fired: false }));

        f.tick(0.0);
        assert!(f.ctx.take_delivered().is_empty());
        assert_eq!(f.queue.len(), 1);

        f.tick(0.0);
        let events = f.ctx.take_delivered();
        assert_eq!(
            events,
            vec![
                OutputEvent::Output {
                    operation_id: OperationId(8),
                    text: "x".to_string(),
                },
                OutputEvent::OperationComplete { operation_id: OperationId(8) },
            ]
        );
        assert!(f.queue.is_empty());
    }

    #[test]
    fn test_plugins_run_after_updates() {
        let seen = Arc::new(AtomicUsize::new(usize::MAX));
        let mut f = Fixture::new(ls_registry());
        f.world.add_plugin(Box::new(Recorder(seen.clone())));
        f.login("user");

        f.run(1, "ls");
        f.tick(0.0);
        // ls already finished and was removed when plugins ran
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
