//! Reagent dispensing and line washing.
//!
//! A transfer routes two selector valves (reagent side, sample side), then
//! runs the inbound pump forward to dispense and the outbound pump in reverse
//! to aspirate. Pump run times come from the volume and the flow rate; every
//! run waits through the interruptible sleep so a stop ends it within one
//! slice.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use ulab_core::{Completion, Result, UlabError};
use ulab_hardware::{Ulab, INBOUND_PUMP_ID, OUTBOUND_PUMP_ID};

use crate::gate::{GateOutcome, OperatorGate};
use crate::wash::{PairKind, WashPlan, WashStep};

/// Selector valve address of the reagent side.
pub const REAGENT_VALVE_ADDR: u8 = 0;
/// Selector valve address of the sample side.
pub const SAMPLE_VALVE_ADDR: u8 = 1;
/// Board id both selector valves answer to.
pub const VALVE_BOARD_ID: u8 = 1;
/// Wait after each valve switch.
pub const VALVE_SETTLE: Duration = Duration::from_millis(500);
/// Tubing volume added to every dispense and aspirate, in µL.
pub const DEAD_VOLUME_UL: f64 = 500.0;
/// Flow rate of a line wash, in µL/s.
pub const WASH_FLOW_UL_S: f64 = 150.0;
/// Pump run time of one line wash.
pub const WASH_DURATION: Duration = Duration::from_secs(15);
/// Peristaltic speed units per µL/s.
pub const SPEED_CONVERSION: f64 = 2.0;

/// Logical name → valve channel.
pub type ChannelMap = BTreeMap<String, u8>;

/// Dispense speed presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeedTier {
    /// 20 µL/s.
    Slow,
    /// 50 µL/s.
    #[default]
    Medium,
    /// 100 µL/s.
    Fast,
}

impl SpeedTier {
    /// Flow rate in µL/s.
    pub fn flow_ul_s(self) -> f64 {
        match self {
            SpeedTier::Slow => 20.0,
            SpeedTier::Medium => 50.0,
            SpeedTier::Fast => 100.0,
        }
    }
}

impl fmt::Display for SpeedTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SpeedTier::Slow => "slow",
            SpeedTier::Medium => "medium",
            SpeedTier::Fast => "fast",
        };
        write!(f, "{}", label)
    }
}

/// Time to move `volume_ul` at `flow_ul_s`, truncated to whole milliseconds.
///
/// ```
/// use std::time::Duration;
/// use ulab_experiment::liquid::{pump_duration, DEAD_VOLUME_UL};
///
/// let run = pump_duration(200.0 + DEAD_VOLUME_UL, 50.0).unwrap();
/// assert_eq!(run, Duration::from_millis(14_000));
/// assert!(pump_duration(200.0, 0.0).is_err());
/// ```
pub fn pump_duration(volume_ul: f64, flow_ul_s: f64) -> Result<Duration> {
    if !flow_ul_s.is_finite() || flow_ul_s <= 0.0 {
        return Err(UlabError::InvalidFlowRate(flow_ul_s));
    }
    if !volume_ul.is_finite() || volume_ul < 0.0 {
        return Err(UlabError::Config(format!(
            "volume must be a non-negative number of uL, got {}",
            volume_ul
        )));
    }
    let millis = (volume_ul / flow_ul_s * 1000.0) as u64;
    Ok(Duration::from_millis(millis))
}

/// Peristaltic speed for a flow rate, saturating at the 16-bit limit.
pub fn hardware_speed(flow_ul_s: f64) -> u16 {
    (flow_ul_s * SPEED_CONVERSION).round() as u16
}

/// Routes valves and runs pumps for dispensing and washing.
pub struct LiquidSequencer {
    ulab: Arc<Ulab>,
    gate: Arc<OperatorGate>,
    reagents: RwLock<ChannelMap>,
    samples: RwLock<ChannelMap>,
}

impl LiquidSequencer {
    /// Empty channel maps; configure them before dispensing.
    pub fn new(ulab: Arc<Ulab>, gate: Arc<OperatorGate>) -> Self {
        Self {
            ulab,
            gate,
            reagents: RwLock::default(),
            samples: RwLock::default(),
        }
    }

    /// Replace the reagent channel map. Takes effect for the next operation.
    pub fn set_reagent_config(&self, reagents: ChannelMap) {
        info!(count = reagents.len(), "reagent channels configured");
        *self.reagents.write() = reagents;
    }

    /// Replace the sample channel map.
    pub fn set_sample_config(&self, samples: ChannelMap) {
        info!(count = samples.len(), "sample channels configured");
        *self.samples.write() = samples;
    }

    /// Copy of the reagent channel map.
    pub fn reagent_config(&self) -> ChannelMap {
        self.reagents.read().clone()
    }

    /// Copy of the sample channel map.
    pub fn sample_config(&self) -> ChannelMap {
        self.samples.read().clone()
    }

    fn message(&self, text: impl Into<String>) {
        self.ulab.events().message(text);
    }

    fn failed(&self, err: UlabError) -> UlabError {
        warn!(error = %err, "liquid operation aborted");
        self.message(format!("error: {}", err));
        err
    }

    fn reagent_channel(&self, name: &str) -> Result<u8> {
        self.reagents
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| self.failed(UlabError::UnknownReagent(name.to_string())))
    }

    fn sample_channel(&self, name: &str) -> Result<u8> {
        self.samples
            .read()
            .get(name)
            .copied()
            .ok_or_else(|| self.failed(UlabError::UnknownSample(name.to_string())))
    }

    fn stopped(&self, what: &str) -> Completion {
        info!(what, "liquid operation stopped");
        self.message(format!("{} stopped", what));
        Completion::Cancelled
    }

    /// Switch the reagent valve, then the sample valve, settling after each.
    async fn route(&self, reagent_channel: u8, sample_channel: u8) -> Result<Completion> {
        let cancel = self.ulab.cancel();
        self.ulab
            .goto_channel(VALVE_BOARD_ID, REAGENT_VALVE_ADDR, reagent_channel)?;
        if cancel.sleep(VALVE_SETTLE).await.is_cancelled() {
            return Ok(Completion::Cancelled);
        }
        self.ulab
            .goto_channel(VALVE_BOARD_ID, SAMPLE_VALVE_ADDR, sample_channel)?;
        Ok(cancel.sleep(VALVE_SETTLE).await.into())
    }

    /// Run pump `id` at `flow_ul_s` for `duration`, then stop it.
    async fn run_pump_for(&self, id: u8, forward: bool, flow_ul_s: f64, duration: Duration) -> Result<Completion> {
        self.ulab.set_speed(id, hardware_speed(flow_ul_s))?;
        self.ulab.rotate(id, true, forward)?;
        let outcome = self.ulab.cancel().sleep(duration).await;
        self.ulab.rotate(id, false, forward)?;
        Ok(outcome.into())
    }

    /// Pump `volume_ul` through pump `id` at `flow_ul_s`.
    pub async fn run_pump(&self, id: u8, forward: bool, flow_ul_s: f64, volume_ul: f64) -> Result<Completion> {
        let duration = pump_duration(volume_ul, flow_ul_s).map_err(|e| self.failed(e))?;
        self.message(format!(
            "pump {}: {} uL at {} uL/s ({} ms)",
            id,
            volume_ul,
            flow_ul_s,
            duration.as_millis()
        ));
        self.run_pump_for(id, forward, flow_ul_s, duration)
            .await
            .map_err(|e| self.failed(e))
    }

    /// Dispense `volume_ul` of `reagent` into `sample`, wait
    /// `inter_step_delay`, then aspirate the same volume back out.
    #[instrument(skip(self))]
    pub async fn add_liquid(
        &self,
        reagent: &str,
        volume_ul: f64,
        speed: SpeedTier,
        sample: &str,
        inter_step_delay: Duration,
    ) -> Result<Completion> {
        if self.ulab.cancel().is_stop_requested() {
            return Ok(self.stopped("add liquid"));
        }
        let reagent_channel = self.reagent_channel(reagent)?;
        let sample_channel = self.sample_channel(sample)?;
        let flow = speed.flow_ul_s();
        let total_ul = volume_ul + DEAD_VOLUME_UL;
        pump_duration(total_ul, flow).map_err(|e| self.failed(e))?;

        self.message(format!(
            "adding {} uL of {} to {} at {} speed",
            volume_ul, reagent, sample, speed
        ));
        if self
            .route(reagent_channel, sample_channel)
            .await
            .map_err(|e| self.failed(e))?
            .is_cancelled()
        {
            return Ok(self.stopped("add liquid"));
        }

        if self.run_pump(INBOUND_PUMP_ID, true, flow, total_ul).await?.is_cancelled() {
            return Ok(self.stopped("add liquid"));
        }
        if !inter_step_delay.is_zero() {
            self.message(format!("waiting {} s before aspirating", inter_step_delay.as_secs_f64()));
            if self.ulab.cancel().sleep(inter_step_delay).await.is_cancelled() {
                return Ok(self.stopped("add liquid"));
            }
        }
        if self.run_pump(OUTBOUND_PUMP_ID, false, flow, total_ul).await?.is_cancelled() {
            return Ok(self.stopped("add liquid"));
        }

        self.message(format!("added {} uL of {} to {}", volume_ul, reagent, sample));
        Ok(Completion::Finished)
    }

    /// Flush the line from `reagent` to `sample` at the wash rate.
    #[instrument(skip(self))]
    pub async fn wash_pipeline(&self, reagent: &str, sample: &str) -> Result<Completion> {
        if self.ulab.cancel().is_stop_requested() {
            return Ok(self.stopped("wash"));
        }
        let reagent_channel = self.reagent_channel(reagent)?;
        let sample_channel = self.sample_channel(sample)?;

        self.message(format!("washing line {} -> {}", reagent, sample));
        let completion = self
            .wash_cycle(WashStep {
                reagent_channel,
                sample_channel,
                kind: PairKind::Direct,
                aspirate: false,
            })
            .await
            .map_err(|e| self.failed(e))?;
        if completion.is_cancelled() {
            return Ok(self.stopped("wash"));
        }
        self.message(format!("washed line {} -> {}", reagent, sample));
        Ok(Completion::Finished)
    }

    async fn wash_cycle(&self, step: WashStep) -> Result<Completion> {
        if self
            .route(step.reagent_channel, step.sample_channel)
            .await?
            .is_cancelled()
        {
            return Ok(Completion::Cancelled);
        }
        if self
            .run_pump_for(INBOUND_PUMP_ID, true, WASH_FLOW_UL_S, WASH_DURATION)
            .await?
            .is_cancelled()
        {
            return Ok(Completion::Cancelled);
        }
        if step.aspirate {
            return self
                .run_pump_for(OUTBOUND_PUMP_ID, false, WASH_FLOW_UL_S, WASH_DURATION)
                .await;
        }
        Ok(Completion::Finished)
    }

    /// Wash every configured line once, then wait for the operator.
    #[instrument(skip(self))]
    pub async fn initial_wash_pipelines(&self) -> Result<Completion> {
        if self.ulab.cancel().is_stop_requested() {
            return Ok(self.stopped("initial wash"));
        }
        let reagents: Vec<u8> = self.reagents.read().values().copied().collect();
        let samples: Vec<u8> = self.samples.read().values().copied().collect();
        let plan = WashPlan::build(reagents, samples).map_err(|e| self.failed(e))?;

        self.message(format!(
            "initial wash: {}, {} cycles, waste on channel {}",
            plan.strategy,
            plan.steps.len(),
            plan.waste_channel
        ));
        for (i, step) in plan.steps.iter().enumerate() {
            self.message(format!(
                "wash {}/{}: reagent channel {} -> sample channel {}{}",
                i + 1,
                plan.steps.len(),
                step.reagent_channel,
                step.sample_channel,
                if step.aspirate { ", aspirating" } else { "" }
            ));
            if self
                .wash_cycle(*step)
                .await
                .map_err(|e| self.failed(e))?
                .is_cancelled()
            {
                return Ok(self.stopped("initial wash"));
            }
        }

        match self.gate.wait("initial wash complete").await {
            GateOutcome::Resumed => Ok(Completion::Finished),
            GateOutcome::Quit | GateOutcome::Cancelled => Ok(self.stopped("initial wash")),
        }
    }
}

impl fmt::Debug for LiquidSequencer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiquidSequencer")
            .field("reagents", &*self.reagents.read())
            .field("samples", &*self.samples.read())
            .finish_non_exhaustive()
    }
}
