//! Audio clock
//!
//! Gain automation is scheduled against this clock rather than wall timers.
//! In the browser it is the audio context's `currentTime`.

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic clock that drives gain automation
#[async_trait]
pub trait AudioClock: Send + Sync {
    /// Time elapsed since the clock started
    fn now(&self) -> Duration;

    /// Suspend until the clock reaches `deadline`
    async fn sleep_until(&self, deadline: Duration);

    /// Suspend for `duration` of clock time
    async fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + duration).await;
    }
}

/// Clock backed by tokio time (follows paused time in tests)
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AudioClock for TokioClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    async fn sleep_until(&self, deadline: Duration) {
        tokio::time::sleep_until(self.origin + deadline).await;
    }
}
