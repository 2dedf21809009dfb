//! Stage calibration: well grid geometry, default speeds and the A1 offset.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulab_core::{Result, UlabError};
use ulab_protocol::{Axis, DeviceCode};

/// Distance the Z axis travels into a well, in mm.
pub const Z_TRAVEL_MM: u16 = 30;
/// Time spent at depth before Z is raised again.
pub const Z_DWELL: Duration = Duration::from_millis(1000);
/// Extra wait added on top of every computed Z move.
pub const Z_SETTLE_BUFFER: Duration = Duration::from_millis(200);
/// Stage speed unit, in hundredths of a mm/s (0.12 mm/s).
const SPEED_UNIT_CENTI_MM_S: u64 = 12;

const Z_MIN_MOVE_MS: u64 = 500;
const Z_DEFAULT_MOVE_MS: u64 = 3000;

/// Calibration of one stage type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageParams {
    /// Stage this calibration belongs to.
    pub device: DeviceCode,
    /// Plate rows.
    pub rows: u16,
    /// Plate columns.
    pub cols: u16,
    /// Row pitch along X, in µm.
    pub step_x_um: u16,
    /// Column pitch along Y, in µm.
    pub step_y_um: u16,
    /// X speed, in 0.12 mm/s units.
    pub speed_x: u16,
    /// Y speed.
    pub speed_y: u16,
    /// Z speed.
    pub speed_z: u16,
    /// Stage X coordinate of well A1, in µm.
    pub offset_x_um: u16,
    /// Stage Y coordinate of well A1, in µm.
    pub offset_y_um: u16,
}

impl StageParams {
    /// Coarse stage with a 4.5 mm well pitch.
    pub const LOW_PRECISION: StageParams = StageParams {
        device: DeviceCode::LowStage,
        rows: 8,
        cols: 12,
        step_x_um: 4500,
        step_y_um: 4500,
        speed_x: 20,
        speed_y: 20,
        speed_z: 100,
        offset_x_um: 14_000,
        offset_y_um: 50_000,
    };

    /// Fine stage with a 0.45 mm pitch.
    pub const HIGH_PRECISION: StageParams = StageParams {
        device: DeviceCode::HighStage,
        rows: 8,
        cols: 12,
        step_x_um: 450,
        step_y_um: 450,
        speed_x: 20,
        speed_y: 20,
        speed_z: 20,
        offset_x_um: 10_000,
        offset_y_um: 10_000,
    };

    /// Absolute X target of plate row `row`.
    pub fn row_x_um(&self, row: u16) -> Result<u16> {
        let target = i64::from(self.offset_x_um) + i64::from(row) * i64::from(self.step_x_um);
        to_travel(Axis::X, target)
    }

    /// Absolute Y target of plate column `col`. Columns run towards the origin.
    pub fn col_y_um(&self, col: u16) -> Result<u16> {
        let target = i64::from(self.offset_y_um) - i64::from(col) * i64::from(self.step_y_um);
        to_travel(Axis::Y, target)
    }

    /// Target of a logical grid coordinate in directed stepping.
    ///
    /// Directed stepping addresses the grid from the stage origin, not from
    /// the A1 offset.
    pub fn step_target_um(&self, axis: Axis, index: i32) -> Result<u16> {
        let step = match axis {
            Axis::X => self.step_x_um,
            Axis::Y => self.step_y_um,
            Axis::Z => return Err(UlabError::InvalidAxis(axis)),
        };
        to_travel(axis, i64::from(index) * i64::from(step))
    }

    /// Whether `(x, y)` lies on the grid: `x` indexes columns, `y` rows.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < i32::from(self.cols) && y < i32::from(self.rows)
    }

    /// Time the Z axis needs for a full travel at this stage's Z speed.
    pub fn z_move_duration(&self) -> Duration {
        z_move_duration(self.speed_z)
    }

    /// `z_move_duration` plus the settle buffer.
    pub fn z_wait(&self) -> Duration {
        self.z_move_duration() + Z_SETTLE_BUFFER
    }
}

fn to_travel(axis: Axis, target_um: i64) -> Result<u16> {
    u16::try_from(target_um).map_err(|_| UlabError::OutOfTravel { axis, target_um })
}

/// `ceil(travel / (speed * 0.12 mm/s))`, floored at 500 ms; 3000 ms when the
/// speed is zero.
pub fn z_move_duration(speed_z: u16) -> Duration {
    if speed_z == 0 {
        return Duration::from_millis(Z_DEFAULT_MOVE_MS);
    }
    let travel = u64::from(Z_TRAVEL_MM) * 1000 * 100;
    let ms = travel.div_ceil(u64::from(speed_z) * SPEED_UNIT_CENTI_MM_S);
    Duration::from_millis(ms.max(Z_MIN_MOVE_MS))
}

/// Calibrations of every known stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageTable {
    stages: Vec<StageParams>,
}

impl Default for StageTable {
    fn default() -> Self {
        Self {
            stages: vec![StageParams::LOW_PRECISION, StageParams::HIGH_PRECISION],
        }
    }
}

impl StageTable {
    /// Built-in table with `overrides` replacing entries for the same device.
    pub fn with_overrides(overrides: impl IntoIterator<Item = StageParams>) -> Self {
        let mut table = Self::default();
        for params in overrides {
            match table.stages.iter_mut().find(|s| s.device == params.device) {
                Some(slot) => *slot = params,
                None => table.stages.push(params),
            }
        }
        table
    }

    /// Calibration of `device`.
    pub fn get(&self, device: DeviceCode) -> Result<&StageParams> {
        self.stages
            .iter()
            .find(|s| s.device == device)
            .ok_or(UlabError::UnknownStage(device))
    }

    /// Every calibration.
    pub fn iter(&self) -> impl Iterator<Item = &StageParams> {
        self.stages.iter()
    }
}
