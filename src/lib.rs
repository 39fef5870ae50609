//! Slip Sweep - wheel-slip vs drawbar-pull parameter sweeps
//!
//! Generates scenario variants over a slip-compliance sweep, runs each one as a
//! timed trial of simulator and telemetry worker processes, aggregates the
//! command/response telemetry into a force-response mean curve, and assembles
//! the per-trial images into a single report.

pub mod aggregate;
pub mod config;
pub mod plot;
pub mod process;
pub mod report;
pub mod schedule;
pub mod sweep;
pub mod telemetry;
pub mod trial;
pub mod variant;

use thiserror::Error;

pub use aggregate::{AggregationTask, Bucket, CurvePoint, CurveSink, Resolution, SampleAggregator};
pub use config::{load_config, ExperimentConfig, LoadedConfig, TrialConfig, VehicleConfig};
pub use process::{CommandSpec, ManagedProcess, ProcessGroup, ProcessSpawner, SystemSpawner};
pub use report::{collect_artifacts, discover_artifacts, DocumentConverter, ReportAssembler};
pub use schedule::{ForceSchedule, TrialDeadline};
pub use sweep::{prepare_workdir, SweepOrchestrator, SweepSummary, TrialOutcome, MANIFEST_FILE};
pub use telemetry::{CommandSample, ObservationPair, ResponseSample, TelemetryEvent};
pub use trial::{artifact_file_name, LaunchPlan, TrialArtifacts, TrialPhase, TrialRunner};
pub use variant::{format_value, ScenarioTemplate, SweepSpec, Variant, VariantGenerator};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("scenario template error: {0}")]
    Template(String),
    #[error("failed to launch {label}: {source}")]
    Launch {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("expected artifact for {subject} missing at {path}")]
    ArtifactMissing { subject: String, path: String },
    #[error("interrupted")]
    Interrupted,
    #[error("plot error: {0}")]
    Plot(String),
}

impl SweepError {
    /// Whether the error must abort the whole sweep rather than a single trial.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SweepError::Config(_) | SweepError::Yaml(_) | SweepError::Interrupted
        )
    }
}
