//! `ulab-core`
//!
//! Runtime types shared by the engine and the sequencers:
//!
//! - [`error`]: the [`UlabError`] type
//! - [`cancel`]: [`CancellationToken`] with its interruptible sleep
//! - [`events`]: the typed [`EventBus`]
//! - [`serial`]: opening, draining and listing serial ports

pub mod cancel;
pub mod error;
pub mod events;
pub mod serial;

pub use cancel::{CancellationToken, SleepOutcome, SLICE};
pub use error::{Result, UlabError};
pub use events::{EventBus, PositionUpdate};
pub use serial::{DynSerial, PortInfo, SerialPortIO};

/// How a long-running operation ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Ran to the end.
    Finished,
    /// A stop or emergency request was observed.
    Cancelled,
}

impl Completion {
    /// True when a stop or emergency cut the operation short.
    pub fn is_cancelled(self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<SleepOutcome> for Completion {
    fn from(outcome: SleepOutcome) -> Self {
        match outcome {
            SleepOutcome::Elapsed => Completion::Finished,
            SleepOutcome::Cancelled => Completion::Cancelled,
        }
    }
}
