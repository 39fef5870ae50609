//! One trial: launch the simulator and telemetry workers for a variant, wait
//! out the deadline, kill everything, and relocate the per-vehicle images.
//!
//! ```text
//! Idle -> Launching -> Running -> TimedOut -> Terminating -> Done
//!            |            |                      ^
//!            +-- launch error / interrupt -------+
//! ```
//!
//! Termination runs on every path out of `Launching` and `Running`.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::TrialConfig;
use crate::plot::plot_file_name;
use crate::process::{CommandSpec, ProcessGroup, ProcessSpawner};
use crate::schedule::TrialDeadline;
use crate::variant::{format_value, Variant};
use crate::SweepError;

const DEFAULT_POLL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialPhase {
    Idle,
    Launching,
    Running,
    TimedOut,
    Terminating,
    Done,
}

impl fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrialPhase::Idle => "idle",
            TrialPhase::Launching => "launching",
            TrialPhase::Running => "running",
            TrialPhase::TimedOut => "timed-out",
            TrialPhase::Terminating => "terminating",
            TrialPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Relocated image name for `vehicle` at swept `value`.
pub fn artifact_file_name(vehicle: &str, value: f64) -> String {
    format!("{vehicle}_slip_{}.png", format_value(value))
}

/// Images produced by one trial, ordered like the configured vehicles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialArtifacts {
    pub index: usize,
    pub parameter_value: f64,
    pub image_paths: Vec<PathBuf>,
    /// Vehicles whose image was absent after the trial
    #[serde(default)]
    pub missing: Vec<String>,
}

impl TrialArtifacts {
    pub fn label(&self) -> String {
        format_value(self.parameter_value)
    }

    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// Every command line a trial starts, in launch order.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchPlan {
    pub simulator: CommandSpec,
    pub publisher: CommandSpec,
    pub plotters: Vec<CommandSpec>,
}

impl LaunchPlan {
    pub fn new(config: &TrialConfig, variant: &Variant) -> Self {
        let launch = &config.launch;

        let simulator = CommandSpec::new("simulator", launch.simulator.program.as_str())
            .args(&launch.simulator.args)
            .arg(variant.source_path.as_os_str());

        let publisher = CommandSpec::new("publisher", launch.publisher.program.as_str())
            .args(&launch.publisher.args)
            .arg("--force-increment")
            .arg(config.force_increment.to_string())
            .arg("--interval")
            .arg(config.interval_secs.to_string())
            .arg("--max-force")
            .arg(config.max_force.to_string());

        let plotters = config
            .vehicles
            .iter()
            .map(|vehicle| {
                CommandSpec::new(format!("plotter:{}", vehicle.label), launch.plotter.program.as_str())
                    .args(&launch.plotter.args)
                    .arg("--drop-points")
                    .arg(config.drop_points.to_string())
                    .arg("--name")
                    .arg(config.wheel_name.as_str())
                    .arg("--xlim")
                    .arg(config.display_limits.xlim.to_string())
                    .arg("--ylim")
                    .arg(config.display_limits.ylim.to_string())
                    .arg("--vehicle_name")
                    .arg(vehicle.label.as_str())
                    .args(&vehicle.transport_args)
            })
            .collect();

        Self {
            simulator,
            publisher,
            plotters,
        }
    }

    /// Simulator, publisher and one plotter per vehicle.
    pub fn process_count(&self) -> usize {
        2 + self.plotters.len()
    }
}

pub struct TrialRunner<S> {
    config: TrialConfig,
    spawner: S,
    run_dir: PathBuf,
    artifact_dir: PathBuf,
    abort: Arc<AtomicBool>,
    poll: Duration,
}

impl<S: ProcessSpawner> TrialRunner<S> {
    /// `run_dir` is where the plotters drop `<vehicle>_plot.png`; images are
    /// moved from there into `artifact_dir`.
    pub fn new(config: TrialConfig, spawner: S, run_dir: &Path, artifact_dir: &Path) -> Self {
        Self {
            config,
            spawner,
            run_dir: run_dir.to_path_buf(),
            artifact_dir: artifact_dir.to_path_buf(),
            abort: Arc::new(AtomicBool::new(false)),
            poll: DEFAULT_POLL,
        }
    }

    pub fn with_abort_flag(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn config(&self) -> &TrialConfig {
        &self.config
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn deadline(&self) -> TrialDeadline {
        self.config.deadline()
    }

    pub fn run(&self, variant: &Variant) -> Result<TrialArtifacts, SweepError> {
        self.enter(variant, TrialPhase::Idle);
        self.clear_stale_plots()?;

        let plan = LaunchPlan::new(&self.config, variant);
        let mut group = ProcessGroup::new();
        let waited = self.launch_and_wait(variant, &plan, &mut group);

        self.enter(variant, TrialPhase::Terminating);
        let terminated = group.terminate_all();
        debug!(
            index = variant.index,
            planned = plan.process_count(),
            terminated,
            "trial processes terminated"
        );
        waited?;

        let artifacts = self.collect(variant)?;
        self.enter(variant, TrialPhase::Done);
        Ok(artifacts)
    }

    fn enter(&self, variant: &Variant, phase: TrialPhase) {
        info!(index = variant.index, value = %variant.label(), %phase, "trial phase");
    }

    fn launch_and_wait(
        &self,
        variant: &Variant,
        plan: &LaunchPlan,
        group: &mut ProcessGroup,
    ) -> Result<(), SweepError> {
        self.enter(variant, TrialPhase::Launching);
        group.launch(&self.spawner, &plan.simulator)?;

        let warmup = Duration::from_secs_f64(self.config.launch.warmup_secs);
        if !self.wait_for(warmup) {
            return Err(SweepError::Interrupted);
        }

        group.launch(&self.spawner, &plan.publisher)?;
        for plotter in &plan.plotters {
            group.launch(&self.spawner, plotter)?;
        }

        let deadline = self.deadline();
        info!(index = variant.index, %deadline, processes = group.len(), "waiting for trial deadline");
        self.enter(variant, TrialPhase::Running);
        if !self.wait_for(deadline.as_duration()) {
            return Err(SweepError::Interrupted);
        }

        self.enter(variant, TrialPhase::TimedOut);
        Ok(())
    }

    /// Sleeps `duration` in poll-sized slices. Returns `false` if aborted.
    fn wait_for(&self, duration: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.abort.load(Ordering::SeqCst) {
                return false;
            }
            let elapsed = started.elapsed();
            if elapsed >= duration {
                return true;
            }
            thread::sleep((duration - elapsed).min(self.poll));
        }
    }

    fn clear_stale_plots(&self) -> Result<(), SweepError> {
        for label in self.config.vehicle_labels() {
            let path = self.run_dir.join(plot_file_name(label));
            match fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), "removed stale plot from a previous run"),
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    fn collect(&self, variant: &Variant) -> Result<TrialArtifacts, SweepError> {
        let mut image_paths = Vec::new();
        let mut missing = Vec::new();

        for label in self.config.vehicle_labels() {
            let source = self.run_dir.join(plot_file_name(label));
            if !source.exists() {
                let err = SweepError::ArtifactMissing {
                    subject: label.to_string(),
                    path: source.display().to_string(),
                };
                warn!(index = variant.index, "{err}");
                missing.push(label.to_string());
                continue;
            }
            let target = self
                .artifact_dir
                .join(artifact_file_name(label, variant.parameter_value));
            relocate(&source, &target)?;
            debug!(from = %source.display(), to = %target.display(), "relocated artifact");
            image_paths.push(target);
        }

        Ok(TrialArtifacts {
            index: variant.index,
            parameter_value: variant.parameter_value,
            image_paths,
            missing,
        })
    }
}

/// Moves a file, falling back to copy and delete across filesystems.
fn relocate(source: &Path, target: &Path) -> io::Result<()> {
    if fs::rename(source, target).is_ok() {
        return Ok(());
    }
    fs::copy(source, target)?;
    fs::remove_file(source)
}
