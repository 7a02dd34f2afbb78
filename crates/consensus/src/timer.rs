//! Round and recovery deadlines.
//!
//! Each round has exactly one deadline: the base block time shifted left by
//! the view number, capped at the configured maximum. A separate, shorter
//! idle deadline drives recovery solicitation and never affects the round
//! deadline.

use crate::ViewNumber;
use std::time::Duration;
use tokio::time::Instant;

/// The single per-round deadline with exponential view backoff.
#[derive(Debug)]
pub struct RoundTimer {
    block_time: Duration,
    max_timeout: Duration,
    deadline: Option<Instant>,
}

impl RoundTimer {
    /// Creates a timer from the base block time and backoff cap.
    pub fn new(block_time_ms: u64, max_view_timeout_ms: u64) -> Self {
        Self {
            block_time: Duration::from_millis(block_time_ms),
            max_timeout: Duration::from_millis(max_view_timeout_ms),
            deadline: None,
        }
    }

    /// Timeout for a view: `block_time << view`, capped at the maximum.
    pub fn timeout_for_view(&self, view: ViewNumber) -> Duration {
        let base_ms = self.block_time.as_millis() as u64;
        let factor = 1u64 << view.value().min(63);
        let shifted = base_ms.checked_mul(factor).unwrap_or(u64::MAX);
        Duration::from_millis(shifted).min(self.max_timeout)
    }

    /// Arms the deadline for the given view, measured from now.
    pub fn start(&mut self, view: ViewNumber) {
        self.deadline = Some(Instant::now() + self.timeout_for_view(view));
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms the deadline. The timer fires at most once per arm.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }
}

/// The idle deadline that triggers recovery solicitation.
#[derive(Debug)]
pub struct RecoveryTimer {
    idle: Duration,
    deadline: Option<Instant>,
}

impl RecoveryTimer {
    /// Creates a recovery timer with the given idle window.
    pub fn new(idle_ms: u64) -> Self {
        Self {
            idle: Duration::from_millis(idle_ms),
            deadline: None,
        }
    }

    /// Re-arms the idle deadline from now. Called on any round activity.
    pub fn reset(&mut self) {
        self.deadline = Some(Instant::now() + self.idle);
    }

    /// The armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Disarms the deadline.
    pub fn disarm(&mut self) {
        self.deadline = None;
    }
}
