//! Plugin hook for background simulation (missions, cron-like jobs).
//!
//! Plugins are registered explicitly on a [`World`](crate::World) and run
//! once per tick after every operation has been updated. They see the World
//! read-only and act on it by enqueueing requests, which are dispatched on
//! the next tick.

use crate::queue::CommandQueue;
use crate::system::SystemDirectory;

use hacknet_env::{OperationId, PersonContext, WorldId};
use std::sync::Arc;
use tracing::debug;

/// A hook ticked once per World tick.
pub trait WorldPlugin: Send {
    fn name(&self) -> &str;

    fn tick(&mut self, cx: &mut PluginContext<'_>);
}

/// What a plugin may see and do during its tick.
pub struct PluginContext<'a> {
    pub(crate) world: WorldId,
    pub(crate) time: f64,
    pub(crate) delta: f64,
    pub(crate) systems: &'a SystemDirectory,
    pub(crate) queue: &'a Arc<CommandQueue>,
    pub(crate) processes: usize,
}

impl<'a> PluginContext<'a> {
    pub fn world(&self) -> WorldId {
        self.world
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    pub fn systems(&self) -> &SystemDirectory {
        self.systems
    }

    /// Number of live processes after this tick's completions.
    pub fn process_count(&self) -> usize {
        self.processes
    }

    /// Queues a command line for the next tick.
    pub fn enqueue(&self, context: Arc<dyn PersonContext>, operation_id: OperationId, line: &str) {
        self.queue.enqueue(self.world, context, operation_id, line);
    }

    /// Queues a login for the next tick.
    pub fn enqueue_login(&self, context: Arc<dyn PersonContext>, operation_id: OperationId, hostname: &str, user: &str) {
        self.queue.enqueue_login(self.world, context, operation_id, hostname, user);
    }
}

/// Runs a command for a fixed context every `interval` simulated seconds.
///
/// The first tick logs the context in; the command is first issued once a
/// full interval has passed after that.
pub struct CronPlugin {
    name: String,
    context: Arc<dyn PersonContext>,
    hostname: String,
    user: String,
    line: String,
    interval: f64,
    elapsed: f64,
    logged_in: bool,
    next_operation: u64,
}

impl CronPlugin {
    pub fn new(
        context: Arc<dyn PersonContext>,
        hostname: impl Into<String>,
        user: impl Into<String>,
        line: impl Into<String>,
        interval: f64,
    ) -> Self {
        let line = line.into();
        Self {
            name: format!("cron({})", line),
            context,
            hostname: hostname.into(),
            user: user.into(),
            line,
            interval,
            elapsed: 0.0,
            logged_in: false,
            next_operation: 1,
        }
    }

    fn next_operation(&mut self) -> OperationId {
        let id = OperationId(self.next_operation);
        self.next_operation += 1;
        id
    }
}

impl WorldPlugin for CronPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn tick(&mut self, cx: &mut PluginContext<'_>) {
        if !self.logged_in {
            let op = self.next_operation();
            cx.enqueue_login(self.context.clone(), op, &self.hostname, &self.user);
            self.logged_in = true;
            return;
        }

        self.elapsed += cx.delta().max(0.0);
        if self.interval <= 0.0 || self.elapsed < self.interval {
            return;
        }
        self.elapsed -= self.interval;

        let op = self.next_operation();
        debug!(world = %cx.world(), plugin = %self.name, %op, "cron firing");
        cx.enqueue(self.context.clone(), op, &self.line);
    }
}
