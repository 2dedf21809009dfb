//! `ulab` command-line entry point.
//!
//! ```bash
//! ulab ports
//! ulab run protocols/immunofluorescence.toml
//! ulab add PBS Sample1 --volume 200 --speed fast --delay 2
//! ulab traverse --stage low --dwell-ms 2000
//! ```
//!
//! Operator lines typed on stdin answer confirmation prompts. `quit` stops
//! every device at any time, as does Ctrl-C.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use ulab::{app, config::UlabConfig, logging};
use ulab_experiment::{Protocol, SpeedTier, Step};
use ulab_hardware::Ulab;
use ulab_protocol::{Axis, DeviceCode};

#[derive(Parser)]
#[command(name = "ulab")]
#[command(about = "Serial control and protocol runner for the uLab liquid handler", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = ulab::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Serial port, overriding the configuration
    #[arg(long, global = true)]
    port: Option<String>,

    /// Log level, overriding the configuration
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,

    /// Run a protocol file
    Run {
        /// Path to the protocol TOML
        protocol: PathBuf,
        /// Record failing steps and carry on
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Flush one line at the wash rate
    Wash { reagent: String, sample: String },

    /// Dispense a reagent into a sample and aspirate it again
    Add {
        reagent: String,
        sample: String,
        /// Volume in uL
        #[arg(long)]
        volume: f64,
        #[arg(long, value_enum, default_value_t = Speed::Medium)]
        speed: Speed,
        /// Seconds between dispensing and aspirating
        #[arg(long, default_value_t = 0.0)]
        delay: f64,
    },

    /// Wash every configured line and wait for confirmation
    InitialWash,

    /// Visit every well of the plate
    Traverse {
        #[arg(long, value_enum, default_value_t = Stage::Low)]
        stage: Stage,
        /// Time spent at each well
        #[arg(long, default_value_t = 0)]
        dwell_ms: u64,
    },

    /// Step cell by cell along one axis, dipping Z at each cell
    Step {
        #[arg(long, value_enum, default_value_t = Stage::Low)]
        stage: Stage,
        #[arg(long, value_enum)]
        axis: StepAxis,
        /// Start column
        #[arg(long, default_value_t = 0)]
        col: i32,
        /// Start row
        #[arg(long, default_value_t = 0)]
        row: i32,
        #[arg(long)]
        steps: u32,
        /// Step towards lower indices
        #[arg(long)]
        reverse: bool,
        #[arg(long, default_value_t = 0)]
        dwell_ms: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Speed {
    Slow,
    Medium,
    Fast,
}

impl From<Speed> for SpeedTier {
    fn from(speed: Speed) -> Self {
        match speed {
            Speed::Slow => SpeedTier::Slow,
            Speed::Medium => SpeedTier::Medium,
            Speed::Fast => SpeedTier::Fast,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Stage {
    Low,
    High,
}

impl From<Stage> for DeviceCode {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Low => DeviceCode::LowStage,
            Stage::High => DeviceCode::HighStage,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum StepAxis {
    X,
    Y,
}

impl From<StepAxis> for Axis {
    fn from(axis: StepAxis) -> Self {
        match axis {
            StepAxis::X => Axis::X,
            StepAxis::Y => Axis::Y,
        }
    }
}

impl Commands {
    /// The protocol this subcommand runs. `None` for commands that need no port.
    fn into_protocol(self) -> Result<Option<Protocol>> {
        let (name, step) = match self {
            Commands::Ports => return Ok(None),
            Commands::Run {
                protocol,
                continue_on_error,
            } => {
                let mut loaded = Protocol::load(&protocol)
                    .with_context(|| format!("failed to load protocol {}", protocol.display()))?;
                loaded.continue_on_error |= continue_on_error;
                return Ok(Some(loaded));
            }
            Commands::Wash { reagent, sample } => ("wash", Step::WashPipeline { reagent, sample }),
            Commands::Add {
                reagent,
                sample,
                volume,
                speed,
                delay,
            } => (
                "add",
                Step::AddLiquid {
                    reagent,
                    volume_ul: volume,
                    speed: speed.into(),
                    sample,
                    delay_s: delay,
                },
            ),
            Commands::InitialWash => ("initial-wash", Step::InitialWash),
            Commands::Traverse { stage, dwell_ms } => (
                "traverse",
                Step::Traverse {
                    stage: stage.into(),
                    dwell_ms,
                },
            ),
            Commands::Step {
                stage,
                axis,
                col,
                row,
                steps,
                reverse,
                dwell_ms,
            } => (
                "step",
                Step::DirectedMove {
                    stage: stage.into(),
                    start: [col, row],
                    axis: axis.into(),
                    positive: !reverse,
                    steps,
                    dwell_ms,
                },
            ),
        };
        let protocol = Protocol {
            name: name.to_string(),
            continue_on_error: false,
            steps: vec![step],
        };
        protocol.validate()?;
        Ok(Some(protocol))
    }
}

fn print_ports() {
    let ports = Ulab::list_ports();
    if ports.is_empty() {
        println!("No serial ports found");
        return;
    }
    for port in ports {
        println!("{:<24} {}", port.name, port.description);
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = UlabConfig::load_from(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    if let Some(port) = cli.port {
        config.port.path = Some(port);
    }
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
    }
    config
        .validate()
        .map_err(|e| anyhow!(e))
        .context("invalid configuration")?;
    logging::init_from_config(&config).map_err(|e| anyhow!(e))?;

    let Some(protocol) = cli.command.into_protocol()? else {
        print_ports();
        return Ok(());
    };
    let port = config
        .port
        .path
        .clone()
        .context("no serial port configured; set [port].path, ULAB_PORT_PATH or --port")?;

    let runner = Arc::new(app::build_runner(&config));
    let report = app::run_session(runner, &port, &protocol, app::spawn_stdin_reader()).await?;

    if report.completion.is_cancelled() {
        println!(
            "'{}' stopped after {} of {} steps",
            protocol.name,
            report.completed,
            protocol.steps.len()
        );
        return Ok(());
    }
    if !report.failures.is_empty() {
        for (step, error) in &report.failures {
            eprintln!("step {} failed: {}", step, error);
        }
        return Err(anyhow!("{} step(s) failed", report.failures.len()));
    }
    println!("'{}' complete", protocol.name);
    Ok(())
}
