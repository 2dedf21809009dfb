//! Experiment protocols: ordered steps loaded from TOML.
//!
//! ```toml
//! name = "rinse"
//!
//! [[steps]]
//! action = "initial_wash"
//!
//! [[steps]]
//! action = "add_liquid"
//! reagent = "PBS"
//! volume_ul = 200.0
//! speed = "medium"
//! sample = "Sample1"
//! delay_s = 1.0
//!
//! [[steps]]
//! action = "wash_pipeline"
//! reagent = "PBS"
//! sample = "Waste"
//! ```
//!
//! Steps run in order. A run ends at the first cancelled step. A failing step
//! ends it too unless `continue_on_error` is set, in which case the failure is
//! recorded and the next step starts.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use ulab_core::{Completion, Result, UlabError};
use ulab_hardware::{GridPos, Ulab};
use ulab_protocol::{Axis, DeviceCode};

use crate::gate::{GateOutcome, OperatorGate};
use crate::liquid::{LiquidSequencer, SpeedTier};
use crate::motion::{DirectedMove, MotionSequencer};

fn default_prompt() -> String {
    "protocol paused".to_string()
}

fn default_true() -> bool {
    true
}

/// One protocol action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    /// Wash every configured line, then wait for the operator.
    InitialWash,
    /// Dispense a reagent into a sample line and aspirate it back out.
    AddLiquid {
        /// Reagent name from the reagent channel map.
        reagent: String,
        /// Volume in µL, dead volume excluded.
        volume_ul: f64,
        /// Dispense speed preset.
        #[serde(default)]
        speed: SpeedTier,
        /// Sample name from the sample channel map.
        sample: String,
        /// Wait between dispensing and aspirating.
        #[serde(default)]
        delay_s: f64,
    },
    /// Flush one line at the wash rate.
    WashPipeline {
        /// Reagent name.
        reagent: String,
        /// Sample name.
        sample: String,
    },
    /// Wait for the operator.
    Pause {
        /// Shown to the operator.
        #[serde(default = "default_prompt")]
        prompt: String,
    },
    /// Visit every well of the plate.
    Traverse {
        /// Stage carrying the plate.
        stage: DeviceCode,
        /// Hold time at each well.
        #[serde(default)]
        dwell_ms: u64,
    },
    /// Step cell by cell along one axis, dipping Z at each cell.
    DirectedMove {
        /// Stage carrying the plate.
        stage: DeviceCode,
        /// `[column, row]` of the start cell.
        start: [i32; 2],
        /// X or Y.
        axis: Axis,
        /// Step towards higher indices.
        #[serde(default = "default_true")]
        positive: bool,
        /// Cells to visit after the start cell.
        steps: u32,
        /// Hold time at each cell.
        #[serde(default)]
        dwell_ms: u64,
    },
    /// Interruptible wait.
    Delay {
        /// Length of the wait.
        seconds: f64,
    },
}

impl Step {
    fn validate(&self) -> std::result::Result<(), String> {
        match self {
            Step::AddLiquid {
                volume_ul, delay_s, ..
            } => {
                if !volume_ul.is_finite() || *volume_ul < 0.0 {
                    return Err(format!("volume_ul must be non-negative, got {}", volume_ul));
                }
                if !delay_s.is_finite() || *delay_s < 0.0 {
                    return Err(format!("delay_s must be non-negative, got {}", delay_s));
                }
            }
            Step::Delay { seconds } => {
                if !seconds.is_finite() || *seconds < 0.0 {
                    return Err(format!("seconds must be non-negative, got {}", seconds));
                }
            }
            Step::Traverse { stage, .. } | Step::DirectedMove { stage, .. } if !stage.is_stage() => {
                return Err(format!("{} is not a stage", stage));
            }
            Step::DirectedMove { axis: Axis::Z, .. } => {
                return Err("directed moves step along x or y".to_string());
            }
            _ => {}
        }
        Ok(())
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::InitialWash => write!(f, "initial wash of all lines"),
            Step::AddLiquid {
                reagent,
                volume_ul,
                speed,
                sample,
                ..
            } => write!(f, "add {} uL of {} to {} ({})", volume_ul, reagent, sample, speed),
            Step::WashPipeline { reagent, sample } => write!(f, "wash line {} -> {}", reagent, sample),
            Step::Pause { prompt } => write!(f, "pause: {}", prompt),
            Step::Traverse { stage, dwell_ms } => {
                write!(f, "traverse plate on {} ({} ms per well)", stage, dwell_ms)
            }
            Step::DirectedMove {
                stage,
                start,
                axis,
                positive,
                steps,
                ..
            } => write!(
                f,
                "{} steps {}{} on {} from ({},{})",
                steps,
                if *positive { "+" } else { "-" },
                axis,
                stage,
                start[0],
                start[1]
            ),
            Step::Delay { seconds } => write!(f, "delay {} s", seconds),
        }
    }
}

/// An ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Protocol {
    /// Display name; defaults to the file stem when loaded from disk.
    #[serde(default)]
    pub name: String,
    /// Record failing steps and carry on instead of stopping.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Steps in execution order.
    pub steps: Vec<Step>,
}

impl Protocol {
    /// Parse and validate a protocol document.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let protocol: Protocol =
            toml::from_str(text).map_err(|e| UlabError::Config(format!("invalid protocol: {}", e)))?;
        protocol.validate()?;
        Ok(protocol)
    }

    /// Read a protocol file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let mut protocol = Self::from_toml_str(&text)?;
        if protocol.name.is_empty() {
            protocol.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
        }
        Ok(protocol)
    }

    /// Check every step, reporting the first bad one by its one-based index.
    pub fn validate(&self) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            step.validate()
                .map_err(|e| UlabError::Config(format!("step {}: {}", i + 1, e)))?;
        }
        Ok(())
    }
}

/// Outcome of a protocol run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// `Cancelled` when a stop ended the run early.
    pub completion: Completion,
    /// Steps that ended `Finished`.
    pub completed: usize,
    /// One-based step index and error text of every failed step.
    pub failures: Vec<(usize, String)>,
}

/// Owns the sequencers of one instrument and runs protocols on them.
#[derive(Debug)]
pub struct ProtocolRunner {
    ulab: Arc<Ulab>,
    gate: Arc<OperatorGate>,
    motion: MotionSequencer,
    liquid: LiquidSequencer,
}

impl ProtocolRunner {
    /// Build the gate and both sequencers around `ulab`.
    pub fn new(ulab: Arc<Ulab>) -> Self {
        let gate = Arc::new(OperatorGate::new(Arc::clone(&ulab)));
        let motion = MotionSequencer::new(Arc::clone(&ulab));
        let liquid = LiquidSequencer::new(Arc::clone(&ulab), Arc::clone(&gate));
        Self {
            ulab,
            gate,
            motion,
            liquid,
        }
    }

    /// The engine.
    pub fn ulab(&self) -> &Arc<Ulab> {
        &self.ulab
    }

    /// Where operator lines are submitted.
    pub fn gate(&self) -> &Arc<OperatorGate> {
        &self.gate
    }

    /// Motion sequencer.
    pub fn motion(&self) -> &MotionSequencer {
        &self.motion
    }

    /// Liquid sequencer.
    pub fn liquid(&self) -> &LiquidSequencer {
        &self.liquid
    }

    /// Run a single step.
    pub async fn execute(&self, step: &Step) -> Result<Completion> {
        match step {
            Step::InitialWash => self.liquid.initial_wash_pipelines().await,
            Step::AddLiquid {
                reagent,
                volume_ul,
                speed,
                sample,
                delay_s,
            } => {
                let delay = Duration::try_from_secs_f64(*delay_s)
                    .map_err(|e| UlabError::Config(format!("delay_s: {}", e)))?;
                self.liquid
                    .add_liquid(reagent, *volume_ul, *speed, sample, delay)
                    .await
            }
            Step::WashPipeline { reagent, sample } => self.liquid.wash_pipeline(reagent, sample).await,
            Step::Pause { prompt } => Ok(match self.gate.wait(prompt).await {
                GateOutcome::Resumed => Completion::Finished,
                GateOutcome::Quit | GateOutcome::Cancelled => Completion::Cancelled,
            }),
            Step::Traverse { stage, dwell_ms } => Ok(self
                .motion
                .full_plate_traversal(*stage, Duration::from_millis(*dwell_ms))
                .await?
                .completion),
            Step::DirectedMove {
                stage,
                start,
                axis,
                positive,
                steps,
                dwell_ms,
            } => {
                self.motion
                    .directed_move(DirectedMove {
                        device: *stage,
                        start: GridPos::new(start[0], start[1]),
                        axis: *axis,
                        positive: *positive,
                        steps: *steps,
                        dwell: Duration::from_millis(*dwell_ms),
                    })
                    .await
            }
            Step::Delay { seconds } => {
                let delay = Duration::try_from_secs_f64(*seconds)
                    .map_err(|e| UlabError::Config(format!("delay: {}", e)))?;
                Ok(self.ulab.cancel().sleep(delay).await.into())
            }
        }
    }

    /// Run every step of `protocol` in order.
    #[instrument(skip_all, fields(protocol = %protocol.name, steps = protocol.steps.len()))]
    pub async fn run(&self, protocol: &Protocol) -> Result<RunReport> {
        let events = self.ulab.events();
        let total = protocol.steps.len();
        let mut report = RunReport {
            completion: Completion::Finished,
            completed: 0,
            failures: Vec::new(),
        };

        events.message(format!("*** starting protocol '{}' ({} steps) ***", protocol.name, total));
        for (i, step) in protocol.steps.iter().enumerate() {
            let index = i + 1;
            if self.ulab.cancel().is_stop_requested() {
                report.completion = Completion::Cancelled;
                break;
            }
            events.message(format!("step {}/{}: {}", index, total, step));
            match self.execute(step).await {
                Ok(Completion::Finished) => report.completed += 1,
                Ok(Completion::Cancelled) => {
                    report.completion = Completion::Cancelled;
                    break;
                }
                Err(e) if protocol.continue_on_error => {
                    warn!(step = index, error = %e, "step failed, continuing");
                    report.failures.push((index, e.to_string()));
                }
                Err(e) => {
                    warn!(step = index, error = %e, "step failed, protocol aborted");
                    events.message(format!("protocol aborted at step {}: {}", index, e));
                    return Err(e);
                }
            }
        }

        if report.completion.is_cancelled() {
            info!(completed = report.completed, "protocol stopped");
            events.message(format!(
                "*** protocol '{}' stopped after {} of {} steps ***",
                protocol.name, report.completed, total
            ));
        } else {
            info!(completed = report.completed, failed = report.failures.len(), "protocol complete");
            events.message(format!("*** protocol '{}' complete ***", protocol.name));
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const RINSE: &str = r#"
        name = "rinse"
        continue_on_error = true

        [[steps]]
        action = "add_liquid"
        reagent = "PBS"
        volume_ul = 200.0
        sample = "Sample1"

        [[steps]]
        action = "add_liquid"
        reagent = "Fixative"
        volume_ul = 200.0
        speed = "fast"
        sample = "Sample1"
        delay_s = 2.0

        [[steps]]
        action = "delay"
        seconds = 1.5

        [[steps]]
        action = "directed_move"
        stage = "low_stage"
        start = [0, 0]
        axis = "y"
        steps = 2
    "#;

    #[test]
    fn test_parse_defaults() {
        let protocol = Protocol::from_toml_str(RINSE).unwrap();
        assert_eq!(protocol.steps.len(), 4);
        assert_eq!(
            protocol.steps[0],
            Step::AddLiquid {
                reagent: "PBS".into(),
                volume_ul: 200.0,
                speed: SpeedTier::Medium,
                sample: "Sample1".into(),
                delay_s: 0.0,
            }
        );
        assert!(matches!(
            protocol.steps[3],
            Step::DirectedMove {
                stage: DeviceCode::LowStage,
                axis: Axis::Y,
                positive: true,
                steps: 2,
                dwell_ms: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_steps_are_rejected() {
        let z_move = r#"
            [[steps]]
            action = "directed_move"
            stage = "high_stage"
            start = [0, 0]
            axis = "z"
            steps = 1
        "#;
        let err = Protocol::from_toml_str(z_move).unwrap_err();
        assert!(err.to_string().contains("step 1"));

        let pump_traverse = r#"
            [[steps]]
            action = "traverse"
            stage = "pump_controller"
        "#;
        assert!(Protocol::from_toml_str(pump_traverse).is_err());

        let unknown = r#"
            [[steps]]
            action = "centrifuge"
        "#;
        assert!(matches!(
            Protocol::from_toml_str(unknown),
            Err(UlabError::Config(_))
        ));
    }

    #[test]
    fn test_load_names_protocol_after_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overnight.toml");
        std::fs::write(&path, "[[steps]]\naction = \"delay\"\nseconds = 1.0\n").unwrap();
        let protocol = Protocol::load(&path).unwrap();
        assert_eq!(protocol.name, "overnight");
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_run_records_failures_and_continues() {
        let ulab = Arc::new(Ulab::default());
        let (_instrument, port) = tokio::io::duplex(4096);
        ulab.attach("sim", port);
        let runner = ProtocolRunner::new(Arc::clone(&ulab));
        runner
            .liquid()
            .set_reagent_config([("PBS".to_string(), 1)].into_iter().collect());
        runner
            .liquid()
            .set_sample_config([("Sample1".to_string(), 2)].into_iter().collect());

        let protocol = Protocol::from_toml_str(RINSE).unwrap();
        let report = runner.run(&protocol).await.unwrap();

        assert_eq!(report.completion, Completion::Finished);
        assert_eq!(report.completed, 3);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, 2);
        assert_eq!(
            ulab.position(DeviceCode::LowStage),
            GridPos::new(0, 2)
        );
        assert!(logs_contain("step failed, continuing"));
        assert!(logs_contain("protocol complete"));
        ulab.close_port().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_run_at_current_step() {
        let ulab = Arc::new(Ulab::default());
        let (_instrument, port) = tokio::io::duplex(4096);
        ulab.attach("sim", port);
        let runner = Arc::new(ProtocolRunner::new(Arc::clone(&ulab)));

        let protocol = Protocol {
            name: "waits".into(),
            continue_on_error: false,
            steps: vec![
                Step::Delay { seconds: 10.0 },
                Step::Delay { seconds: 10.0 },
            ],
        };
        let run = Arc::clone(&runner);
        let handle = tokio::spawn(async move { run.run(&protocol).await });
        tokio::time::sleep(Duration::from_secs(12)).await;
        ulab.stop_all_devices().await;

        let report = handle.await.unwrap().unwrap();
        assert_eq!(report.completion, Completion::Cancelled);
        assert_eq!(report.completed, 1);
        ulab.close_port().await;
    }

    #[tokio::test]
    async fn test_unknown_reagent_aborts_without_continue() {
        let ulab = Arc::new(Ulab::default());
        let (_instrument, port) = tokio::io::duplex(4096);
        ulab.attach("sim", port);
        let runner = ProtocolRunner::new(Arc::clone(&ulab));

        let protocol = Protocol {
            name: "strict".into(),
            continue_on_error: false,
            steps: vec![Step::WashPipeline {
                reagent: "PBS".into(),
                sample: "Waste".into(),
            }],
        };
        assert!(matches!(
            runner.run(&protocol).await,
            Err(UlabError::UnknownReagent(_))
        ));
        ulab.close_port().await;
    }
}
