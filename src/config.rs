use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schedule::TrialDeadline;
use crate::variant::{SweepSpec, LABEL_RESOLUTION, SWEEP_START};
use crate::SweepError;

/// Experiment configuration document.
///
/// The nine top-level scalar keys are required; `vehicles` and `launch`
/// default to the two-tricycle Gazebo setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExperimentConfig {
    /// Drawbar pull step between consecutive command levels [N]
    pub force_increment: f64,
    /// Largest drawbar pull magnitude [N]
    pub max_force: f64,
    /// Time each command level is held [s]
    pub interval: f64,
    /// Step of the slip compliance sweep
    pub slip_increment: f64,
    /// Exclusive upper bound of the slip compliance sweep
    pub slip_max: f64,
    /// Response samples discarded after every command change
    pub drop_points: u32,
    /// Name of the tracked wheel
    pub name: String,
    /// Horizontal plot half-range [N]
    pub xlim: f64,
    /// Vertical plot half-range
    pub ylim: f64,
    #[serde(default = "default_vehicles")]
    pub vehicles: Vec<VehicleConfig>,
    #[serde(default)]
    pub launch: LaunchConfig,
}

/// One measured vehicle; each gets its own response-collecting worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VehicleConfig {
    /// Output file prefix, passed to the worker as `--vehicle_name`
    pub label: String,
    /// Human readable caption used in the report
    #[serde(default)]
    pub caption: String,
    /// Transport remapping arguments, passed through verbatim
    #[serde(default)]
    pub transport_args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|arg| arg.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LaunchConfig {
    pub simulator: CommandTemplate,
    pub publisher: CommandTemplate,
    pub plotter: CommandTemplate,
    /// Pause after starting the simulator before the workers are started [s]
    pub warmup_secs: f64,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            simulator: CommandTemplate::new("gzserver", &["--verbose"]),
            publisher: CommandTemplate::new("drawbar_pull_publisher", &[]),
            plotter: CommandTemplate::new("drawbar_pull_plotter", &[]),
            warmup_secs: 3.0,
        }
    }
}

fn default_vehicles() -> Vec<VehicleConfig> {
    [
        ("cycle0", "Plowing effect tricycle", "/trisphere_cycle_slip0/wheel_slip"),
        ("cycle1", "Normal tricycle", "/trisphere_cycle_slip1/wheel_slip"),
    ]
    .into_iter()
    .map(|(label, caption, topic)| VehicleConfig {
        label: label.to_string(),
        caption: caption.to_string(),
        transport_args: vec![
            "--ros-args".to_string(),
            "--remap".to_string(),
            format!("wheel_slip:={topic}"),
        ],
    })
    .collect()
}

/// Plot half-ranges shared by every response-collecting worker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DisplayLimits {
    pub xlim: f64,
    pub ylim: f64,
}

/// Read-only per-trial view of the configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialConfig {
    pub force_increment: f64,
    pub max_force: f64,
    pub interval_secs: f64,
    pub drop_points: u32,
    pub wheel_name: String,
    pub vehicles: Vec<VehicleConfig>,
    pub display_limits: DisplayLimits,
    pub launch: LaunchConfig,
}

impl TrialConfig {
    pub fn deadline(&self) -> TrialDeadline {
        TrialDeadline::from_trial(self)
    }

    pub fn vehicle_labels(&self) -> impl Iterator<Item = &str> {
        self.vehicles.iter().map(|vehicle| vehicle.label.as_str())
    }
}

impl ExperimentConfig {
    pub fn from_yaml_str(raw: &str) -> Result<Self, SweepError> {
        serde_yaml::from_str(raw).map_err(|err| SweepError::Config(err.to_string()))
    }

    pub fn validate(&self) -> Result<(), SweepError> {
        let positive = [
            ("force-increment", self.force_increment),
            ("max-force", self.max_force),
            ("interval", self.interval),
            ("slip-increment", self.slip_increment),
            ("xlim", self.xlim),
            ("ylim", self.ylim),
        ];
        for (key, value) in positive {
            if !value.is_finite() || value <= 0.0 {
                return Err(SweepError::Config(format!(
                    "{key} must be a finite value greater than zero, got {value}"
                )));
            }
        }

        if self.slip_increment < LABEL_RESOLUTION {
            return Err(SweepError::Config(format!(
                "slip-increment must be at least {LABEL_RESOLUTION} so every value gets its own files, got {}",
                self.slip_increment
            )));
        }

        let deadline = TrialDeadline::new(self.force_increment, self.max_force, self.interval);
        if deadline.try_as_duration().is_none() {
            return Err(SweepError::Config(format!(
                "trial deadline {} s derived from max-force, force-increment and interval is out of range",
                deadline.as_secs_f64()
            )));
        }

        if !self.slip_max.is_finite() || self.slip_max <= SWEEP_START {
            return Err(SweepError::Config(format!(
                "slip-max must be greater than the sweep start {SWEEP_START}, got {}",
                self.slip_max
            )));
        }

        if self.name.trim().is_empty() {
            return Err(SweepError::Config("name must not be empty".to_string()));
        }

        if self.vehicles.is_empty() {
            return Err(SweepError::Config(
                "at least one vehicle must be configured".to_string(),
            ));
        }

        for (idx, vehicle) in self.vehicles.iter().enumerate() {
            if vehicle.label.trim().is_empty() {
                return Err(SweepError::Config(format!(
                    "vehicle {idx} has an empty label"
                )));
            }
            if self.vehicles[..idx].iter().any(|v| v.label == vehicle.label) {
                return Err(SweepError::Config(format!(
                    "duplicate vehicle label {}",
                    vehicle.label
                )));
            }
        }

        if Duration::try_from_secs_f64(self.launch.warmup_secs).is_err() {
            return Err(SweepError::Config(
                "launch warmup-secs must be a zero or positive number of seconds".to_string(),
            ));
        }

        Ok(())
    }

    pub fn sweep_spec(&self) -> SweepSpec {
        SweepSpec::new(SWEEP_START, self.slip_increment, self.slip_max)
    }

    pub fn trial_config(&self) -> TrialConfig {
        TrialConfig {
            force_increment: self.force_increment,
            max_force: self.max_force,
            interval_secs: self.interval,
            drop_points: self.drop_points,
            wheel_name: self.name.clone(),
            vehicles: self.vehicles.clone(),
            display_limits: DisplayLimits {
                xlim: self.xlim,
                ylim: self.ylim,
            },
            launch: self.launch.clone(),
        }
    }
}

/// A parsed configuration together with its verbatim text.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ExperimentConfig,
    pub raw: String,
}

pub fn load_config(path: &Path) -> Result<LoadedConfig, SweepError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        SweepError::Config(format!("cannot read {}: {err}", path.display()))
    })?;
    let config = ExperimentConfig::from_yaml_str(&raw)?;
    config.validate()?;
    Ok(LoadedConfig { config, raw })
}

#[cfg(test)]
pub(crate) const SAMPLE_CONFIG: &str = "\
force-increment: 10
max-force: 100
interval: 2
slip-increment: 0.02
slip-max: 0.07
drop-points: 10
name: wheel_rear_left
xlim: 80
ylim: 1.1
";
