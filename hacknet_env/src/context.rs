//! Clock abstraction driving the server tick loop.

use async_trait::async_trait;
use std::time::Duration;

/// The source of wall-clock time for the tick driver.
///
/// This trait abstracts the "real world" so that the tick driver can run
/// both in production (tokio) and under a manually advanced clock in tests.
///
/// # Implementations
///
/// - **Production**: `TokioClock` - wraps `std::time::Instant` and `tokio::time`
/// - **Tests**: `ManualClock` (in `hacknet_server`) - virtual time advanced by hand
///
/// Simulated World time is derived from the deltas between successive
/// `now()` readings, so a clock that does not advance produces zero deltas.
#[async_trait]
pub trait WorldClock: Send + Sync + 'static {
    /// Returns the current monotonic time since clock creation.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// Under a manual clock: advances virtual time
    async fn sleep(&self, duration: Duration);
}
