//! Error type shared by the engine and the sequencers.
//!
//! `UlabError` covers everything an operation can fail on:
//!
//! - **Link**: `Io`, `PortNotOpen`, `Frame`
//! - **Configuration**: `UnknownReagent`, `UnknownSample`, `UnknownStage`, `Config`
//! - **Motion**: `InvalidAxis`, `OutOfBounds`, `OutOfTravel`, `PositionTimeout`, `WaiterBusy`
//! - **Liquid handling**: `InvalidFlowRate`
//!
//! A stop or emergency request is never reported through this type. Sequencers
//! return `Completion::Cancelled` for that instead.

use thiserror::Error;
use ulab_protocol::{Axis, DeviceCode, FrameError};

/// Convenience alias for results using [`UlabError`].
pub type Result<T> = std::result::Result<T, UlabError>;

/// Failure of an engine or sequencer operation.
#[derive(Error, Debug)]
pub enum UlabError {
    /// Serial port I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command was issued while no port is attached.
    #[error("serial port is not open")]
    PortNotOpen,

    /// An inbound frame failed to decode.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Reagent name not present in the reagent channel map.
    #[error("reagent '{0}' is not configured")]
    UnknownReagent(String),

    /// Sample name not present in the sample channel map.
    #[error("sample '{0}' is not configured")]
    UnknownSample(String),

    /// A dispense or aspirate duration was requested with a non-positive flow rate.
    #[error("flow rate must be positive, got {0} uL/s")]
    InvalidFlowRate(f64),

    /// No calibration exists for the requested device.
    #[error("no stage calibration for {0}")]
    UnknownStage(DeviceCode),

    /// Directed stepping only moves along X or Y.
    #[error("{0} cannot be used for directed stepping")]
    InvalidAxis(Axis),

    /// A step would leave the well grid.
    #[error("well ({col}, {row}) is outside the {cols}x{rows} plate")]
    OutOfBounds {
        /// Requested column.
        col: i32,
        /// Requested row.
        row: i32,
        /// Plate columns.
        cols: u16,
        /// Plate rows.
        rows: u16,
    },

    /// A computed stage target does not fit the 16-bit position field.
    #[error("{axis} target {target_um} um is outside stage travel")]
    OutOfTravel {
        /// Axis of the move.
        axis: Axis,
        /// Computed target in µm.
        target_um: i64,
    },

    /// The stage never reported the target position.
    #[error("{device} {axis} did not reach {target_um} um (last seen: {})", display_last(.last_seen_um))]
    PositionTimeout {
        /// Stage that was waited on.
        device: DeviceCode,
        /// Axis that was waited on.
        axis: Axis,
        /// Expected position in µm.
        target_um: u16,
        /// Last reported position, if any arrived.
        last_seen_um: Option<u16>,
    },

    /// Another wait on the same (device, axis) is in flight.
    #[error("a position wait on {device} {axis} is already in progress")]
    WaiterBusy {
        /// Stage already being waited on.
        device: DeviceCode,
        /// Axis already being waited on.
        axis: Axis,
    },

    /// Semantic configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

fn display_last(last: &Option<u16>) -> String {
    match last {
        Some(pos) => format!("{} um", pos),
        None => "none".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_reports_last_position() {
        let err = UlabError::PositionTimeout {
            device: DeviceCode::LowStage,
            axis: Axis::X,
            target_um: 14_000,
            last_seen_um: Some(12_500),
        };
        assert_eq!(
            err.to_string(),
            "low-precision stage AXIS X did not reach 14000 um (last seen: 12500 um)"
        );

        let err = UlabError::PositionTimeout {
            device: DeviceCode::HighStage,
            axis: Axis::Y,
            target_um: 10,
            last_seen_um: None,
        };
        assert!(err.to_string().ends_with("(last seen: none)"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: UlabError = io.into();
        assert!(matches!(err, UlabError::Io(_)));
    }
}
