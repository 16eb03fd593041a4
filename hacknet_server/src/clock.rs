//! Manually advanced clock for deterministic driver tests.

use async_trait::async_trait;
use hacknet_env::WorldClock;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Clock backed by virtual time.
///
/// Time only moves through [`ManualClock::advance_time`], [`ManualClock::set_time`]
/// or [`WorldClock::sleep`], which advances it instead of waiting. Clones
/// share the same time, so a test can hold one copy while the driver owns
/// another.
#[derive(Clone, Default)]
pub struct ManualClock {
    /// Current virtual time (nanoseconds since clock creation)
    virtual_time_ns: Arc<Mutex<u64>>,
}

impl ManualClock {
    /// Creates a clock at time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an Arc-wrapped clock for sharing.
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn time(&self) -> MutexGuard<'_, u64> {
        self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.time();
        *time = time.saturating_add(duration.as_nanos() as u64);
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        *self.time() = time_ns;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.time()
    }
}

#[async_trait]
impl WorldClock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
    }
}
