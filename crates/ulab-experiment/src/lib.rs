//! `ulab-experiment`
//!
//! Sequencing on top of the device engine:
//!
//! - [`motion`]: directed stepping and full-plate serpentine traversal
//! - [`liquid`]: dispensing, line washing and pump timing
//! - [`wash`]: reagent/sample pairing for the initial wash
//! - [`gate`]: operator confirmation between phases
//! - [`protocol`]: TOML protocols and the runner that executes them

pub mod gate;
pub mod liquid;
pub mod motion;
pub mod protocol;
pub mod wash;

pub use gate::{GateOutcome, GateState, OperatorGate, OperatorInput, Submitted};
pub use liquid::{pump_duration, ChannelMap, LiquidSequencer, SpeedTier};
pub use motion::{serpentine_order, DirectedMove, MotionSequencer, MotionState, RetryPolicy, TraversalReport, Well};
pub use protocol::{Protocol, ProtocolRunner, RunReport, Step};
pub use wash::{PairKind, WashPlan, WashStep, WashStrategy};
