//! Server tick driver.
//!
//! One driver advances every World sequentially. Each tick it:
//! 1. Measures the wall time elapsed since the previous tick
//! 2. Drains the command queue in one locked call
//! 3. Ticks every World with its share of the batch and the elapsed seconds
//! 4. Syncs snapshots to persistence when the sync interval is due
//!
//! The driver then sleeps for what is left of the tick period. A tick that
//! overruns its period is followed immediately by the next one; simulated
//! time always advances by the true elapsed time, never by the period.

use crate::config::ServerConfig;

use hacknet_core::{CommandQueue, Persistence, QueuedCommand, QueuedRequest, World, WorldSnapshot};
use hacknet_env::{OutputEvent, WorldClock, WorldId};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Counters describing the driver's run so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub ticks: u64,
    pub overruns: u64,
    pub syncs: u64,
    pub sync_failures: u64,
    /// Queue entries naming a World this server does not host
    pub misrouted: u64,
}

/// Paces the clock and advances every World once per tick.
pub struct TickDriver<C: WorldClock> {
    clock: Arc<C>,
    worlds: Vec<World>,
    queue: Arc<CommandQueue>,
    persistence: Arc<dyn Persistence>,

    tick_period: Duration,
    sync_interval: Duration,
    last_tick: Duration,
    last_sync: Duration,

    /// Reused drain buffer
    working: Vec<QueuedCommand>,
    stop: Arc<AtomicBool>,
    stats: DriverStats,
}

impl<C: WorldClock> TickDriver<C> {
    pub fn new(
        clock: Arc<C>,
        worlds: Vec<World>,
        queue: Arc<CommandQueue>,
        persistence: Arc<dyn Persistence>,
        config: &ServerConfig,
    ) -> Self {
        let now = clock.now();
        Self {
            clock,
            worlds,
            queue,
            persistence,
            tick_period: config.tick_period(),
            sync_interval: config.sync_interval(),
            last_tick: now,
            last_sync: now,
            working: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            stats: DriverStats::default(),
        }
    }

    pub fn worlds(&self) -> &[World] {
        &self.worlds
    }

    pub fn world_mut(&mut self, id: WorldId) -> Option<&mut World> {
        self.worlds.iter_mut().find(|world| world.id() == id)
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// Flag that ends [`TickDriver::run`] after the current tick.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    /// Runs one tick without pacing.
    pub fn tick_once(&mut self) {
        let now = self.clock.now();
        let elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = now;

        let mut working = std::mem::take(&mut self.working);
        let drained = self.queue.drain_into(&mut working);

        let mut batches: Vec<Vec<QueuedCommand>> = self.worlds.iter().map(|_| Vec::new()).collect();
        for command in working.drain(..) {
            match self.worlds.iter().position(|world| world.id() == command.world) {
                Some(index) => batches[index].push(command),
                None => {
                    self.stats.misrouted += 1;
                    reject_misrouted(command);
                }
            }
        }
        self.working = working;

        let seconds = elapsed.as_secs_f64();
        for (world, batch) in self.worlds.iter_mut().zip(batches) {
            world.tick(batch, seconds);
        }
        self.stats.ticks += 1;
        trace!(tick = self.stats.ticks, drained, elapsed_ms = elapsed.as_millis() as u64, "tick");

        if !self.sync_interval.is_zero() && now.saturating_sub(self.last_sync) >= self.sync_interval {
            self.last_sync = now;
            self.sync();
        }
    }

    /// Runs one tick, then sleeps for the rest of the tick period.
    async fn paced_tick(&mut self) {
        let started = self.clock.now();
        self.tick_once();
        let spent = self.clock.now().saturating_sub(started);

        if spent < self.tick_period {
            self.clock.sleep(self.tick_period - spent).await;
        } else {
            self.stats.overruns += 1;
            debug!(
                spent_ms = spent.as_millis() as u64,
                period_ms = self.tick_period.as_millis() as u64,
                "tick overran its period"
            );
        }
    }

    /// Runs `count` paced ticks.
    pub async fn run_ticks(&mut self, count: u64) {
        for _ in 0..count {
            self.paced_tick().await;
        }
    }

    /// Ticks until the stop flag is raised, then shuts down.
    ///
    /// # Returns
    /// Number of processes force-completed by the shutdown.
    pub async fn run(&mut self) -> usize {
        info!(
            worlds = self.worlds.len(),
            period_ms = self.tick_period.as_millis() as u64,
            "tick driver started"
        );
        while !self.stop.load(Ordering::Acquire) {
            self.paced_tick().await;
        }
        self.shutdown()
    }

    /// Writes a snapshot of every World to persistence.
    ///
    /// Failures are logged and counted; the next interval retries.
    pub fn sync(&mut self) -> bool {
        let snapshots: Vec<WorldSnapshot> = self.worlds.iter().map(World::snapshot).collect();
        match self.persistence.sync(&snapshots) {
            Ok(()) => {
                self.stats.syncs += 1;
                debug!(worlds = snapshots.len(), "persistence synced");
                true
            }
            Err(e) => {
                self.stats.sync_failures += 1;
                error!("persistence sync failed: {}", e);
                false
            }
        }
    }

    /// Force-completes every remaining process, then runs a final sync so
    /// the state written by completion callbacks is kept.
    pub fn shutdown(&mut self) -> usize {
        self.stop.store(true, Ordering::Release);
        let completed: usize = self.worlds.iter_mut().map(World::shutdown).sum();
        let synced = self.sync();
        info!(completed, synced, ticks = self.stats.ticks, "tick driver stopped");
        completed
    }
}

/// Tells the origin its request named an unknown World.
fn reject_misrouted(command: QueuedCommand) {
    warn!(world = %command.world, context = %command.context.id(), "no such world");
    if matches!(command.request, QueuedRequest::Disconnect) {
        return;
    }

    let operation_id = command.operation_id;
    command.context.write_event(OutputEvent::Error {
        operation_id,
        message: format!("{}: no such world", command.world),
    });
    command.context.write_event(OutputEvent::OperationComplete { operation_id });
    if let Err(e) = command.context.flush() {
        debug!(context = %command.context.id(), "flush failed: {}", e);
    }
}
