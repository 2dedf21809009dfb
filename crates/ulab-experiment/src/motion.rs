//! Stage motion sequences.
//!
//! Two runs are supported:
//!
//! - **Directed move**: step a stage cell by cell along X or Y, dipping Z at
//!   every cell. X/Y moves are timed with fixed settle delays.
//! - **Full-plate traversal**: visit every well of the plate once in
//!   serpentine order. Every move is confirmed through the response waiter.
//!
//! Progress is published on a `watch` channel of [`MotionState`] and as
//! message events. A stop or emergency request ends either run with
//! `Completion::Cancelled` at its next checkpoint.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use ulab_core::{Completion, Result, UlabError};
use ulab_hardware::{GridPos, StageParams, Ulab, WaitOutcome, WaitParams, Z_DWELL, Z_TRAVEL_MM};
use ulab_protocol::{Axis, DeviceCode};

/// Wait after each X/Y move while moving to a directed run's start cell.
pub const CALIBRATION_SETTLE: Duration = Duration::from_millis(1500);
/// Wait after each directed step.
pub const STEP_SETTLE: Duration = Duration::from_millis(800);
/// Wait after sending the Z speed.
pub const SPEED_SETTLE: Duration = Duration::from_millis(100);
/// Wait after each axis move of the A1 approach, before confirming.
pub const A1_AXIS_SETTLE: Duration = Duration::from_millis(5000);
/// Pause between confirmed arrival at A1 and the first dwell.
pub const A1_ARRIVAL_PAUSE: Duration = Duration::from_millis(1000);

/// Phase of the current motion run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionState {
    /// No run since start-up.
    Idle,
    /// Sending home commands.
    Homing,
    /// Confirming arrival at A1.
    Calibrating,
    /// Moving between cells.
    Stepping,
    /// Holding at a cell.
    Dwelling,
    /// Last run finished.
    Done,
    /// Last run was stopped.
    Aborted,
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            MotionState::Idle => "idle",
            MotionState::Homing => "homing",
            MotionState::Calibrating => "calibrating",
            MotionState::Stepping => "stepping",
            MotionState::Dwelling => "dwelling",
            MotionState::Done => "done",
            MotionState::Aborted => "aborted",
        };
        write!(f, "{}", label)
    }
}

/// A plate well by zero-based row and column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Well {
    /// Zero-based row, `A` is 0.
    pub row: u16,
    /// Zero-based column.
    pub col: u16,
}

impl Well {
    /// Well at `row`, `col`.
    pub fn new(row: u16, col: u16) -> Self {
        Self { row, col }
    }
}

/// `A1`..`H12`; anything outside an 8x12 plate is `Unknown`.
impl fmt::Display for Well {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.row > 7 || self.col > 11 {
            return write!(f, "Unknown");
        }
        let letter = char::from(b'A' + self.row as u8);
        write!(f, "{}{}", letter, self.col + 1)
    }
}

/// Visit order of a serpentine traversal: row by row, columns ascending on
/// even rows and descending on odd rows. Starts at A1.
pub fn serpentine_order(rows: u16, cols: u16) -> Vec<Well> {
    let mut wells = Vec::with_capacity(usize::from(rows) * usize::from(cols));
    for row in 0..rows {
        if row % 2 == 0 {
            wells.extend((0..cols).map(|col| Well::new(row, col)));
        } else {
            wells.extend((0..cols).rev().map(|col| Well::new(row, col)));
        }
    }
    wells
}

/// Parameters of a directed move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectedMove {
    /// Stage to move.
    pub device: DeviceCode,
    /// Cell to start from; `x` is the column, `y` the row.
    pub start: GridPos,
    /// X or Y.
    pub axis: Axis,
    /// Step towards higher indices.
    pub positive: bool,
    /// Cells to visit after the start cell.
    pub steps: u32,
    /// Time to stay at each cell after the Z dip.
    pub dwell: Duration,
}

/// Outcome of a full-plate traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalReport {
    /// Wells reached, in visit order.
    pub visited: Vec<Well>,
    /// Whether every well was visited.
    pub completion: Completion,
}

/// Retry bound for confirmed moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Waits tried before giving up, including the first.
    pub attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Runs directed moves and plate traversals on the engine's stages.
#[derive(Debug)]
pub struct MotionSequencer {
    ulab: Arc<Ulab>,
    state: watch::Sender<MotionState>,
    retry: RetryPolicy,
    wait: WaitParams,
}

impl MotionSequencer {
    /// Idle sequencer with the default retry and wait settings.
    pub fn new(ulab: Arc<Ulab>) -> Self {
        let (state, _) = watch::channel(MotionState::Idle);
        Self {
            ulab,
            state,
            retry: RetryPolicy::default(),
            wait: WaitParams::default(),
        }
    }

    /// Override the retry bound.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Override the position wait settings.
    pub fn with_wait_params(mut self, wait: WaitParams) -> Self {
        self.wait = wait;
        self
    }

    /// Current phase.
    pub fn state(&self) -> MotionState {
        *self.state.borrow()
    }

    /// Watch phase changes.
    pub fn subscribe_state(&self) -> watch::Receiver<MotionState> {
        self.state.subscribe()
    }

    fn enter(&self, state: MotionState) {
        self.state.send_replace(state);
    }

    fn message(&self, text: impl Into<String>) {
        self.ulab.events().message(text);
    }

    fn cancelled(&self, reason: &str) -> Completion {
        warn!(reason, "motion cancelled");
        self.message(reason);
        self.enter(MotionState::Aborted);
        Completion::Cancelled
    }

    fn failed(&self, err: UlabError) -> UlabError {
        self.message(format!("error: {}", err));
        self.enter(MotionState::Aborted);
        err
    }

    fn stage(&self, device: DeviceCode) -> Result<StageParams> {
        self.ulab.stage(device).copied().map_err(|e| self.failed(e))
    }

    /// Sleep that ends the run on a stop request.
    async fn pause(&self, duration: Duration, reason: &str) -> Option<Completion> {
        if self.ulab.cancel().sleep(duration).await.is_cancelled() {
            Some(self.cancelled(reason))
        } else {
            None
        }
    }

    fn check(&self, reason: &str) -> Option<Completion> {
        self.ulab
            .cancel()
            .should_abort()
            .then(|| self.cancelled(reason))
    }

    // =========================================================================
    // Directed move
    // =========================================================================

    /// Step `mv.steps` cells from `mv.start` along `mv.axis`, dipping Z into
    /// every cell.
    ///
    /// A step that would leave the plate aborts with `OutOfBounds` before
    /// anything is sent for it; the stage stays on the last cell reached.
    #[instrument(skip(self), fields(device = %mv.device, axis = %mv.axis))]
    pub async fn directed_move(&self, mv: DirectedMove) -> Result<Completion> {
        let cancel = self.ulab.cancel();
        cancel.clear_emergency();

        let params = self.stage(mv.device)?;
        if mv.axis == Axis::Z {
            return Err(self.failed(UlabError::InvalidAxis(mv.axis)));
        }
        let device = mv.device;

        self.enter(MotionState::Homing);
        self.message("homing Z to the safe position");
        self.ulab.home(device, Axis::Z).map_err(|e| self.failed(e))?;

        let current = self.ulab.position(device);
        if current != mv.start {
            if let Some(done) = self.check("emergency stop active, calibration cancelled") {
                return Ok(done);
            }
            self.enter(MotionState::Calibrating);
            self.message(format!(
                "current cell {} differs from start cell {}, calibrating",
                current, mv.start
            ));
            if mv.start.x != current.x {
                let target = params.step_target_um(Axis::X, mv.start.x).map_err(|e| self.failed(e))?;
                self.ulab.goto(device, Axis::X, target).map_err(|e| self.failed(e))?;
                if let Some(done) = self.pause(CALIBRATION_SETTLE, "calibration interrupted").await {
                    return Ok(done);
                }
            }
            if mv.start.y != current.y {
                let target = params.step_target_um(Axis::Y, mv.start.y).map_err(|e| self.failed(e))?;
                self.ulab.goto(device, Axis::Y, target).map_err(|e| self.failed(e))?;
                if let Some(done) = self.pause(CALIBRATION_SETTLE, "calibration interrupted").await {
                    return Ok(done);
                }
            }
            self.ulab.set_position(device, mv.start);
        }

        self.ulab
            .set_stage_speed(device, Axis::Z, params.speed_z)
            .map_err(|e| self.failed(e))?;
        if let Some(done) = self.pause(SPEED_SETTLE, "movement interrupted by emergency stop").await {
            return Ok(done);
        }

        let z_down_um = Z_TRAVEL_MM * 1000;
        let z_wait = params.z_wait();

        for step in 0..mv.steps {
            if let Some(done) = self.check("movement interrupted by emergency stop") {
                return Ok(done);
            }
            self.enter(MotionState::Stepping);

            let mut next = self.ulab.position(device);
            let delta = if mv.positive { 1 } else { -1 };
            let index = match mv.axis {
                Axis::X => {
                    next.x += delta;
                    next.x
                }
                _ => {
                    next.y += delta;
                    next.y
                }
            };
            if !params.contains(next.x, next.y) {
                return Err(self.failed(UlabError::OutOfBounds {
                    col: next.x,
                    row: next.y,
                    cols: params.cols,
                    rows: params.rows,
                }));
            }

            let target = params.step_target_um(mv.axis, index).map_err(|e| self.failed(e))?;
            self.ulab.goto(device, mv.axis, target).map_err(|e| self.failed(e))?;
            if let Some(done) = self.pause(STEP_SETTLE, "movement interrupted by emergency stop").await {
                return Ok(done);
            }
            self.ulab.set_position(device, next);
            self.message(format!(
                "[{}] step {}/{} reached cell {}",
                device,
                step + 1,
                mv.steps,
                next
            ));

            if let Some(done) = self.check("emergency stop before Z move") {
                return Ok(done);
            }
            self.message(format!("lowering Z by {} mm", Z_TRAVEL_MM));
            self.ulab.goto(device, Axis::Z, z_down_um).map_err(|e| self.failed(e))?;
            if let Some(done) = self.pause(z_wait, "emergency stop while lowering Z").await {
                return Ok(done);
            }

            if let Some(done) = self.check("emergency stop after lowering Z") {
                return Ok(done);
            }
            self.message(format!("Z dwelling at depth for {} ms", Z_DWELL.as_millis()));
            if let Some(done) = self.pause(Z_DWELL, "emergency stop during Z dwell").await {
                return Ok(done);
            }

            if let Some(done) = self.check("emergency stop after Z dwell") {
                return Ok(done);
            }
            self.message("raising Z to origin");
            self.ulab.goto(device, Axis::Z, 0).map_err(|e| self.failed(e))?;
            if let Some(done) = self.pause(z_wait, "emergency stop while raising Z").await {
                return Ok(done);
            }

            if !mv.dwell.is_zero() {
                if let Some(done) = self.check("emergency stop before dwell") {
                    return Ok(done);
                }
                self.enter(MotionState::Dwelling);
                self.message(format!("dwelling at cell {} for {} ms", next, mv.dwell.as_millis()));
                if let Some(done) = self.pause(mv.dwell, "emergency stop during dwell").await {
                    return Ok(done);
                }
            }
        }

        self.enter(MotionState::Done);
        self.message(format!("[{}] directed move complete", device));
        Ok(Completion::Finished)
    }

    // =========================================================================
    // Full-plate traversal
    // =========================================================================

    /// Move to `target_um` and confirm arrival, retrying per the retry policy.
    ///
    /// Exhausted retries fail with `PositionTimeout` carrying the last
    /// reported position. A stop or emergency request during a wait or a
    /// back-off returns `Completion::Cancelled`.
    pub async fn goto_confirmed(&self, device: DeviceCode, axis: Axis, target_um: u16) -> Result<Completion> {
        let mut last_seen_um = None;
        for attempt in 1..=self.retry.attempts {
            self.ulab.goto(device, axis, target_um)?;
            let outcome = self
                .ulab
                .wait_for_position(device, axis, target_um, self.wait)
                .await?;
            if outcome.reached {
                return Ok(Completion::Finished);
            }
            if outcome.cancelled {
                return Ok(Completion::Cancelled);
            }
            last_seen_um = outcome.last_seen_um.or(last_seen_um);
            if attempt < self.retry.attempts {
                self.message(format!(
                    "retrying {} of {} ({}/{})",
                    axis,
                    device,
                    attempt,
                    self.retry.attempts - 1
                ));
                if self.ulab.cancel().sleep(self.retry.backoff).await.is_cancelled() {
                    return Ok(Completion::Cancelled);
                }
            }
        }
        Err(UlabError::PositionTimeout {
            device,
            axis,
            target_um,
            last_seen_um,
        })
    }

    /// Approach A1 by sending X and Y, settling, then confirming both.
    async fn approach_a1(&self, params: &StageParams) -> Result<Completion> {
        let device = params.device;
        let target_x = params.row_x_um(0)?;
        let target_y = params.col_y_um(0)?;
        let mut x = WaitOutcome::default();
        let mut y = WaitOutcome::default();

        for attempt in 0..self.retry.attempts {
            if attempt > 0 {
                self.message(format!(
                    "positioning failed, retry {}/{}: target X {} Y {}, last X {} Y {}",
                    attempt,
                    self.retry.attempts - 1,
                    target_x,
                    target_y,
                    display(x.last_seen_um),
                    display(y.last_seen_um)
                ));
            }

            self.ulab.goto(device, Axis::X, target_x)?;
            if let Some(done) = self.pause(A1_AXIS_SETTLE, "traversal interrupted by emergency stop").await {
                return Ok(done);
            }
            self.ulab.goto(device, Axis::Y, target_y)?;
            if let Some(done) = self.pause(A1_AXIS_SETTLE, "traversal interrupted by emergency stop").await {
                return Ok(done);
            }

            x = self
                .ulab
                .wait_for_position(device, Axis::X, target_x, self.wait)
                .await?;
            if x.cancelled {
                return Ok(self.cancelled("traversal interrupted by emergency stop"));
            }
            y = self
                .ulab
                .wait_for_position(device, Axis::Y, target_y, self.wait)
                .await?;
            if y.cancelled {
                return Ok(self.cancelled("traversal interrupted by emergency stop"));
            }
            if x.reached && y.reached {
                return Ok(Completion::Finished);
            }

            if let Some(done) = self.pause(self.retry.backoff, "traversal interrupted by emergency stop").await {
                return Ok(done);
            }
        }

        self.message("maximum retries reached, positioning at A1 failed");
        let (axis, target_um, last_seen_um) = if x.reached {
            (Axis::Y, target_y, y.last_seen_um)
        } else {
            (Axis::X, target_x, x.last_seen_um)
        };
        Err(UlabError::PositionTimeout {
            device,
            axis,
            target_um,
            last_seen_um,
        })
    }

    /// Visit every well once in serpentine order, dwelling `dwell` at each.
    ///
    /// The logical position is reset to "before A1" first; A1 is the
    /// reference point every other target is computed from.
    #[instrument(skip(self), fields(device = %device))]
    pub async fn full_plate_traversal(&self, device: DeviceCode, dwell: Duration) -> Result<TraversalReport> {
        let cancel = self.ulab.cancel();
        cancel.clear_emergency();
        let params = self.stage(device)?;

        let mut report = TraversalReport {
            visited: Vec::with_capacity(usize::from(params.rows) * usize::from(params.cols)),
            completion: Completion::Finished,
        };

        self.ulab.set_position(device, GridPos::UNSET);
        self.enter(MotionState::Calibrating);
        self.message("--- initial positioning: moving to A1 ---");
        match self.approach_a1(&params).await {
            Ok(Completion::Finished) => {}
            Ok(Completion::Cancelled) => {
                report.completion = Completion::Cancelled;
                return Ok(report);
            }
            Err(e) => return Err(self.failed(e)),
        }

        let a1 = Well::new(0, 0);
        self.ulab.set_position(device, GridPos::ORIGIN);
        report.visited.push(a1);
        self.message("reached A1, starting traversal in 1 s");
        if let Some(done) = self.pause(A1_ARRIVAL_PAUSE, "traversal interrupted by emergency stop").await {
            report.completion = done;
            return Ok(report);
        }
        if !dwell.is_zero() {
            self.enter(MotionState::Dwelling);
            self.message(format!("waiting at well {} for {} ms", a1, dwell.as_millis()));
            if let Some(done) = self.pause(dwell, "traversal interrupted by emergency stop").await {
                report.completion = done;
                return Ok(report);
            }
        }

        let mut current_row = None;
        for well in serpentine_order(params.rows, params.cols) {
            if let Some(done) = self.check("traversal interrupted by emergency stop") {
                report.completion = done;
                return Ok(report);
            }
            self.enter(MotionState::Stepping);

            if current_row != Some(well.row) {
                current_row = Some(well.row);
                let target_x = params.row_x_um(well.row).map_err(|e| self.failed(e))?;
                self.message(format!(
                    "moving to row {} (X: {} um)",
                    char::from(b'A' + (well.row % 26) as u8),
                    target_x
                ));
                match self.goto_confirmed(device, Axis::X, target_x).await {
                    Ok(Completion::Finished) => {}
                    Ok(Completion::Cancelled) => {
                        report.completion = self.cancelled("traversal interrupted by emergency stop");
                        return Ok(report);
                    }
                    Err(e) => return Err(self.failed(e)),
                }
            }
            if well == a1 {
                continue;
            }

            let target_y = params.col_y_um(well.col).map_err(|e| self.failed(e))?;
            match self.goto_confirmed(device, Axis::Y, target_y).await {
                Ok(Completion::Finished) => {}
                Ok(Completion::Cancelled) => {
                    report.completion = self.cancelled("traversal interrupted by emergency stop");
                    return Ok(report);
                }
                Err(e) => return Err(self.failed(e)),
            }

            self.ulab
                .set_position(device, GridPos::new(i32::from(well.col), i32::from(well.row)));
            report.visited.push(well);
            self.message(format!("reached well {}", well));

            if !dwell.is_zero() {
                self.enter(MotionState::Dwelling);
                self.message(format!("waiting at well {} for {} ms", well, dwell.as_millis()));
                if let Some(done) = self.pause(dwell, "traversal interrupted by emergency stop").await {
                    report.completion = done;
                    return Ok(report);
                }
            }
        }

        self.enter(MotionState::Done);
        info!(wells = report.visited.len(), "traversal complete");
        self.message(format!("[{}] full-plate traversal complete", device));
        Ok(report)
    }
}

fn display(pos: Option<u16>) -> String {
    pos.map_or_else(|| "none".to_string(), |p| p.to_string())
}
