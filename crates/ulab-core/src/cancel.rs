//! Cooperative cancellation shared by every long-running operation.
//!
//! Two independent flags:
//!
//! - **emergency**: aborts motion. Set by `EmergencyStop`, cleared when a new
//!   motion run starts.
//! - **stop**: full shutdown. Set by `StopAllDevices`, stays set until
//!   explicitly cleared.
//!
//! Nothing is preempted. Loops poll [`CancellationToken::should_abort`] at
//! their checkpoints and long waits go through [`CancellationToken::sleep`],
//! which re-checks the flags every [`SLICE`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Granularity of interruptible sleeps.
pub const SLICE: Duration = Duration::from_millis(100);

/// How an interruptible sleep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// The full duration passed.
    Elapsed,
    /// A flag was raised first.
    Cancelled,
}

impl SleepOutcome {
    /// True when the sleep was cut short.
    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Default)]
struct Flags {
    emergency: AtomicBool,
    stop: AtomicBool,
}

/// Cloneable handle to the shared stop flags.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flags: Arc<Flags>,
}

impl CancellationToken {
    /// Both flags clear.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the emergency flag.
    pub fn trigger_emergency(&self) {
        self.flags.emergency.store(true, Ordering::Release);
    }

    /// Lower the emergency flag before a new motion run.
    pub fn clear_emergency(&self) {
        self.flags.emergency.store(false, Ordering::Release);
    }

    /// Emergency flag.
    pub fn is_emergency(&self) -> bool {
        self.flags.emergency.load(Ordering::Acquire)
    }

    /// Raise the shutdown flag. Stays set until [`clear_stop`](Self::clear_stop).
    pub fn request_stop(&self) {
        self.flags.stop.store(true, Ordering::Release);
    }

    /// Lower the shutdown flag.
    pub fn clear_stop(&self) {
        self.flags.stop.store(false, Ordering::Release);
    }

    /// Shutdown flag.
    pub fn is_stop_requested(&self) -> bool {
        self.flags.stop.load(Ordering::Acquire)
    }

    /// Either flag is set.
    pub fn should_abort(&self) -> bool {
        self.is_emergency() || self.is_stop_requested()
    }

    /// Sleep for `duration` in [`SLICE`] steps, returning early once either
    /// flag is set.
    pub async fn sleep(&self, duration: Duration) -> SleepOutcome {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.should_abort() {
                return SleepOutcome::Cancelled;
            }
            let step = remaining.min(SLICE);
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        if self.should_abort() {
            SleepOutcome::Cancelled
        } else {
            SleepOutcome::Elapsed
        }
    }
}
