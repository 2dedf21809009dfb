//! `ulab-hardware`
//!
//! The device engine of the liquid-handling instrument.
//!
//! - [`queue`]: FIFO of frames waiting for the wire
//! - [`transport`]: the task that owns the port (dispatch, parse, polling, telemetry)
//! - [`waiter`]: position confirmation with re-poll and timeout
//! - [`stage`]: stage calibration table and Z timing
//! - [`engine`]: [`Ulab`], the primitive command surface and stop handling
//!
//! # Example
//!
//! ```
//! use ulab_hardware::{GridPos, Ulab};
//! use ulab_protocol::{Axis, DeviceCode};
//!
//! # tokio_test::block_on(async {
//! let ulab = Ulab::default();
//! let (_instrument, port) = tokio::io::duplex(256);
//! ulab.attach("sim", port);
//!
//! ulab.home(DeviceCode::LowStage, Axis::X)?;
//! ulab.goto(DeviceCode::LowStage, Axis::X, 14_000)?;
//! assert_eq!(ulab.position(DeviceCode::LowStage), GridPos::ORIGIN);
//! assert_eq!(ulab.queue().len(), 2);
//!
//! ulab.close_port().await;
//! # Ok::<(), ulab_core::UlabError>(())
//! # }).unwrap();
//! ```

pub mod engine;
pub mod queue;
pub mod stage;
pub mod transport;
pub mod waiter;

pub use engine::{GridPos, Ulab, INBOUND_PUMP_ID, OUTBOUND_PUMP_ID, STOP_SETTLE};
pub use queue::CommandQueue;
pub use stage::{z_move_duration, StageParams, StageTable, Z_DWELL, Z_SETTLE_BUFFER, Z_TRAVEL_MM};
pub use transport::{PollRegistry, TelemetrySwitch, TransportPump, TransportSettings};
pub use waiter::{ResponseWaiter, WaitOutcome, WaitParams};
