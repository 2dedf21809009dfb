//! Configuration loaded with Figment.
//!
//! Sources, later ones winning:
//! 1. `config/ulab.toml` (or the file given on the command line)
//! 2. Environment variables prefixed with `ULAB_`. The first `_` after the
//!    prefix separates the section from the key, so `ULAB_PORT_PATH` sets
//!    `port.path` and `ULAB_TIMING_POLL_INTERVAL_MS` sets
//!    `timing.poll_interval_ms`.
//!
//! # Example
//! ```no_run
//! use ulab::config::UlabConfig;
//!
//! let config = UlabConfig::load()?;
//! println!("port: {:?}", config.port.path);
//! # Ok::<(), figment::Error>(())
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use ulab_hardware::{StageParams, StageTable, TransportSettings};
use ulab_protocol::BAUD_RATE;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/ulab.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UlabConfig {
    /// `[application]`
    #[serde(default)]
    pub application: ApplicationConfig,
    /// `[port]`
    #[serde(default)]
    pub port: PortConfig,
    /// `[timing]`
    #[serde(default)]
    pub timing: TimingConfig,
    /// Reagent name → reagent-side valve channel.
    #[serde(default)]
    pub reagents: BTreeMap<String, u8>,
    /// Sample name → sample-side valve channel. The lowest channel is waste.
    #[serde(default)]
    pub samples: BTreeMap<String, u8>,
    /// Replacements for the built-in stage calibrations.
    #[serde(default)]
    pub stages: Vec<StageParams>,
}

/// Identity and logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Shown in the startup log line.
    #[serde(default = "default_name")]
    pub name: String,
    /// trace, debug, info, warn or error
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// pretty, compact or json
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Serial link settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`.
    #[serde(default)]
    pub path: Option<String>,
    /// Link speed, 115200 by default.
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            path: None,
            baud_rate: default_baud_rate(),
        }
    }
}

/// Transport periods in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Gap between two written frames.
    #[serde(default = "default_dispatch_interval")]
    pub dispatch_interval_ms: u64,
    /// Read and decode period.
    #[serde(default = "default_parse_interval")]
    pub parse_interval_ms: u64,
    /// Position polling period.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Pressure and flow polling period.
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: default_dispatch_interval(),
            parse_interval_ms: default_parse_interval(),
            poll_interval_ms: default_poll_interval(),
            telemetry_interval_ms: default_telemetry_interval(),
        }
    }
}

fn default_name() -> String {
    "uLab".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_baud_rate() -> u32 {
    BAUD_RATE
}

fn default_dispatch_interval() -> u64 {
    100
}

fn default_parse_interval() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_telemetry_interval() -> u64 {
    6000
}

impl UlabConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from `path` and the environment. A missing file yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Self::figment(path.as_ref()).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new().merge(Toml::file(path)).merge(
            Env::prefixed("ULAB_").map(|key| key.as_str().replacen('_', ".", 1).into()),
        )
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        if self.port.baud_rate == 0 {
            return Err("baud_rate must be non-zero".to_string());
        }

        let timing = &self.timing;
        for (name, value) in [
            ("dispatch_interval_ms", timing.dispatch_interval_ms),
            ("parse_interval_ms", timing.parse_interval_ms),
            ("poll_interval_ms", timing.poll_interval_ms),
            ("telemetry_interval_ms", timing.telemetry_interval_ms),
        ] {
            if value == 0 {
                return Err(format!("{} must be non-zero", name));
            }
        }
        if timing.parse_interval_ms >= timing.dispatch_interval_ms {
            return Err(format!(
                "parse_interval_ms ({}) must be shorter than dispatch_interval_ms ({})",
                timing.parse_interval_ms, timing.dispatch_interval_ms
            ));
        }

        for (side, channels) in [("reagent", &self.reagents), ("sample", &self.samples)] {
            if let Some((name, _)) = channels.iter().find(|(_, channel)| **channel == 0) {
                return Err(format!("{} '{}' uses channel 0; channels start at 1", side, name));
            }
        }

        let mut devices = HashSet::new();
        for stage in &self.stages {
            if !stage.device.is_stage() {
                return Err(format!("{} has no stage calibration", stage.device));
            }
            if !devices.insert(stage.device) {
                return Err(format!("Duplicate stage calibration for {}", stage.device));
            }
            if stage.rows == 0 || stage.cols == 0 {
                return Err(format!("{} needs at least one row and one column", stage.device));
            }
        }

        Ok(())
    }

    /// `[timing]` as engine settings.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            dispatch_interval: Duration::from_millis(self.timing.dispatch_interval_ms),
            parse_interval: Duration::from_millis(self.timing.parse_interval_ms),
            poll_interval: Duration::from_millis(self.timing.poll_interval_ms),
            telemetry_interval: Duration::from_millis(self.timing.telemetry_interval_ms),
        }
    }

    /// Built-in calibrations with `[[stages]]` entries applied on top.
    pub fn stage_table(&self) -> StageTable {
        StageTable::with_overrides(self.stages.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use ulab_protocol::DeviceCode;

    #[test]
    fn test_defaults_are_valid() {
        let config = UlabConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.port.baud_rate, 115_200);
        assert_eq!(config.transport_settings(), TransportSettings::default());
        assert_eq!(config.stage_table(), StageTable::default());
    }

    #[test]
    fn test_load_file_with_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ulab.toml");
        std::fs::write(
            &path,
            r#"
            [application]
            name = "bench"
            log_level = "debug"

            [port]
            path = "/dev/ttyUSB0"

            [timing]
            telemetry_interval_ms = 4000

            [reagents]
            PBS = 1
            Fixative = 2

            [samples]
            Waste = 1
            Sample1 = 2

            [[stages]]
            device = "high_stage"
            rows = 4
            cols = 6
            step_x_um = 900
            step_y_um = 900
            speed_x = 10
            speed_y = 10
            speed_z = 10
            offset_x_um = 12000
            offset_y_um = 12000
            "#,
        )
        .unwrap();

        let config = UlabConfig::load_from(&path).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.application.name, "bench");
        assert_eq!(config.port.path.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.timing.telemetry_interval_ms, 4000);
        assert_eq!(config.timing.dispatch_interval_ms, 100);
        assert_eq!(config.reagents.get("Fixative"), Some(&2));
        assert_eq!(config.samples.len(), 2);

        let stages = config.stage_table();
        assert_eq!(stages.get(DeviceCode::HighStage).unwrap().rows, 4);
        assert_eq!(
            stages.get(DeviceCode::LowStage).unwrap(),
            &StageParams::LOW_PRECISION
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("ulab.toml", "[port]\npath = \"/dev/ttyS0\"\n")?;
            jail.set_env("ULAB_PORT_PATH", "/dev/ttyACM1");
            jail.set_env("ULAB_PORT_BAUD_RATE", "57600");
            jail.set_env("ULAB_TIMING_POLL_INTERVAL_MS", "500");

            let config = UlabConfig::load_from("ulab.toml")?;
            assert_eq!(config.port.path.as_deref(), Some("/dev/ttyACM1"));
            assert_eq!(config.port.baud_rate, 57_600);
            assert_eq!(config.timing.poll_interval_ms, 500);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = UlabConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.reagents.is_empty());
    }

    #[test]
    fn test_invalid_values() {
        let mut config = UlabConfig::default();
        config.application.log_level = "verbose".into();
        assert!(config.validate().is_err());

        let mut config = UlabConfig::default();
        config.timing.parse_interval_ms = 150;
        assert!(config.validate().unwrap_err().contains("parse_interval_ms"));

        let mut config = UlabConfig::default();
        config.reagents.insert("PBS".into(), 0);
        assert!(config.validate().is_err());

        let mut config = UlabConfig::default();
        config.stages = vec![StageParams::LOW_PRECISION, StageParams::LOW_PRECISION];
        assert!(config.validate().unwrap_err().contains("Duplicate"));

        let mut config = UlabConfig::default();
        config.stages = vec![StageParams {
            device: DeviceCode::PumpController,
            ..StageParams::HIGH_PRECISION
        }];
        assert!(config.validate().is_err());
    }
}
