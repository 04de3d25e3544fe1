//! Time abstractions for testability
//!
//! Every timeout and poll interval in the lifecycle machine goes through
//! [`Clock`], so long windows (a 300 s start timeout) run instantly under
//! [`SimulatedClock`].

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Instant in time (monotonic clock)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(u64); // Microseconds since the clock's epoch

impl Instant {
    pub fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    pub fn as_micros(&self) -> u64 {
        self.0
    }

    /// Duration since another instant
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// Abstraction for time operations
#[async_trait]
pub trait Clock: Send + Sync {
    /// Get current instant (monotonic)
    fn now(&self) -> Instant;

    /// Get current wall-clock time
    fn system_time(&self) -> SystemTime;

    /// Sleep for a duration
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by tokio
pub struct SystemClock {
    origin: std::time::Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.origin.elapsed().as_micros() as u64)
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock whose `sleep` advances time instead of waiting
///
/// Clones share the same timeline.
#[derive(Clone)]
pub struct SimulatedClock {
    current_micros: Arc<AtomicU64>,
    epoch: SystemTime,
}

impl SimulatedClock {
    /// Create a clock whose wall time starts at `epoch`
    pub fn new(epoch: SystemTime) -> Self {
        Self {
            current_micros: Arc::new(AtomicU64::new(0)),
            epoch,
        }
    }

    /// Clock starting at 2024-01-01T00:00:00Z
    pub fn starting_at_2024() -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(1_704_067_200))
    }

    /// Advance time by duration
    pub fn advance(&self, duration: Duration) {
        self.current_micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }

    /// Total virtual time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.current_micros.load(Ordering::SeqCst))
    }
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::starting_at_2024()
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> Instant {
        Instant::from_micros(self.current_micros.load(Ordering::SeqCst))
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}
