use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ExperimentConfig;
use crate::process::ProcessSpawner;
use crate::trial::{TrialArtifacts, TrialRunner};
use crate::variant::{format_value, ScenarioTemplate, VariantGenerator};
use crate::SweepError;

pub const MANIFEST_FILE: &str = "manifest.json";

/// Empties `path`, creating it if needed, and returns it as an absolute path.
///
/// Workers run with the working directory as their cwd, so every path handed
/// to them must not depend on the caller's cwd.
pub fn prepare_workdir(path: &Path) -> Result<PathBuf, SweepError> {
    match fs::remove_dir_all(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::create_dir_all(path)?;
    let absolute = fs::canonicalize(path)?;
    info!(path = %absolute.display(), "prepared working directory");
    Ok(absolute)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialOutcome {
    Completed(TrialArtifacts),
    /// Ran to the deadline but at least one image was missing
    Incomplete(TrialArtifacts),
    Failed {
        index: usize,
        parameter_value: f64,
        message: String,
    },
}

impl TrialOutcome {
    pub fn index(&self) -> usize {
        match self {
            TrialOutcome::Completed(artifacts) | TrialOutcome::Incomplete(artifacts) => artifacts.index,
            TrialOutcome::Failed { index, .. } => *index,
        }
    }

    pub fn parameter_value(&self) -> f64 {
        match self {
            TrialOutcome::Completed(artifacts) | TrialOutcome::Incomplete(artifacts) => {
                artifacts.parameter_value
            }
            TrialOutcome::Failed {
                parameter_value, ..
            } => *parameter_value,
        }
    }

    pub fn artifacts(&self) -> Option<&TrialArtifacts> {
        match self {
            TrialOutcome::Completed(artifacts) | TrialOutcome::Incomplete(artifacts) => Some(artifacts),
            TrialOutcome::Failed { .. } => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, TrialOutcome::Completed(_))
    }
}

/// Record of one sweep run, persisted as `manifest.json` in the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub deadline_secs: f64,
    pub interrupted: bool,
    pub trials: Vec<TrialOutcome>,
}

impl SweepSummary {
    fn start(deadline_secs: f64) -> Self {
        Self {
            started_at: timestamp(),
            finished_at: None,
            deadline_secs,
            interrupted: false,
            trials: Vec::new(),
        }
    }

    pub fn completed(&self) -> usize {
        self.trials.iter().filter(|trial| trial.is_completed()).count()
    }

    pub fn failed(&self) -> usize {
        self.trials
            .iter()
            .filter(|trial| matches!(trial, TrialOutcome::Failed { .. }))
            .count()
    }

    /// Artifact sets of every trial that produced all of its images.
    pub fn completed_artifacts(&self) -> Vec<TrialArtifacts> {
        self.trials
            .iter()
            .filter(|trial| trial.is_completed())
            .filter_map(TrialOutcome::artifacts)
            .cloned()
            .collect()
    }

    pub fn write_manifest(&self, dir: &Path) -> Result<PathBuf, SweepError> {
        let path = dir.join(MANIFEST_FILE);
        let payload = serde_json::to_string_pretty(self)?;
        fs::write(&path, payload)?;
        Ok(path)
    }

    pub fn load_manifest(dir: &Path) -> Result<Self, SweepError> {
        let raw = fs::read_to_string(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Runs every variant of the sweep through one [`TrialRunner`], strictly in order.
pub struct SweepOrchestrator<S> {
    generator: VariantGenerator,
    runner: TrialRunner<S>,
    workdir: PathBuf,
}

impl<S: ProcessSpawner> SweepOrchestrator<S> {
    pub fn new(generator: VariantGenerator, runner: TrialRunner<S>, workdir: &Path) -> Self {
        Self {
            generator,
            runner,
            workdir: workdir.to_path_buf(),
        }
    }

    /// Wires a sweep whose scenarios, worker output and relocated images all
    /// live in `workdir`.
    pub fn from_config(
        config: &ExperimentConfig,
        template: ScenarioTemplate,
        workdir: &Path,
        spawner: S,
        abort: Arc<AtomicBool>,
    ) -> Self {
        let generator = VariantGenerator::new(template, config.sweep_spec(), workdir);
        let runner = TrialRunner::new(config.trial_config(), spawner, workdir, workdir)
            .with_abort_flag(abort);
        Self::new(generator, runner, workdir)
    }

    pub fn runner(&self) -> &TrialRunner<S> {
        &self.runner
    }

    /// Runs the whole sweep and writes the manifest.
    ///
    /// Per-trial failures, including a scenario that cannot be written, are
    /// recorded and the sweep moves on. A fatal error
    /// (an interrupt) stops the sweep; the manifest is still written.
    pub fn run(&self) -> Result<SweepSummary, SweepError> {
        let deadline = self.runner.deadline();
        let mut summary = SweepSummary::start(deadline.as_secs_f64());
        info!(
            trials = self.generator.spec().len(),
            %deadline,
            workdir = %self.workdir.display(),
            "starting sweep"
        );

        let mut fatal = None;
        for (index, value) in self.generator.spec().values().enumerate() {
            let variant = match self.generator.render_variant(index, value) {
                Ok(variant) => variant,
                Err(err) => {
                    error!(index, value = %format_value(value), "cannot render scenario: {err}");
                    summary.trials.push(TrialOutcome::Failed {
                        index,
                        parameter_value: value,
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            match self.runner.run(&variant) {
                Ok(artifacts) if artifacts.is_complete() => {
                    info!(index = variant.index, value = %variant.label(), "trial completed");
                    summary.trials.push(TrialOutcome::Completed(artifacts));
                }
                Ok(artifacts) => {
                    warn!(
                        index = variant.index,
                        missing = ?artifacts.missing,
                        "trial incomplete, excluded from report"
                    );
                    summary.trials.push(TrialOutcome::Incomplete(artifacts));
                }
                Err(err) => {
                    error!(index = variant.index, value = %variant.label(), "trial failed: {err}");
                    summary.trials.push(TrialOutcome::Failed {
                        index: variant.index,
                        parameter_value: variant.parameter_value,
                        message: err.to_string(),
                    });
                    if err.is_fatal() {
                        summary.interrupted = matches!(err, SweepError::Interrupted);
                        fatal = Some(err);
                        break;
                    }
                }
            }
        }

        summary.finished_at = Some(timestamp());
        let manifest = summary.write_manifest(&self.workdir)?;
        info!(
            completed = summary.completed(),
            failed = summary.failed(),
            total = summary.trials.len(),
            manifest = %manifest.display(),
            "sweep finished"
        );

        match fatal {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }
}
