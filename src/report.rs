//! Combined Markdown report over every trial of a sweep.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info, warn};

use crate::config::VehicleConfig;
use crate::sweep::{SweepSummary, MANIFEST_FILE};
use crate::trial::TrialArtifacts;
use crate::SweepError;

const IMAGE_WIDTH: u32 = 350;

#[derive(Debug, Clone)]
pub struct ReportAssembler {
    config_text: String,
    vehicles: Vec<VehicleConfig>,
}

impl ReportAssembler {
    pub fn new(config_text: &str, vehicles: &[VehicleConfig]) -> Self {
        Self {
            config_text: config_text.to_string(),
            vehicles: vehicles.to_vec(),
        }
    }

    /// Names the image columns, e.g. `Plowing effect tricycle (left), Normal tricycle (right)`.
    pub fn column_legend(&self) -> String {
        let names = self.vehicles.iter().map(|vehicle| {
            if vehicle.caption.is_empty() {
                vehicle.label.as_str()
            } else {
                vehicle.caption.as_str()
            }
        });
        if self.vehicles.len() == 2 {
            names
                .zip(["left", "right"])
                .map(|(name, side)| format!("{name} ({side})"))
                .collect::<Vec<_>>()
                .join(", ")
        } else {
            names
                .enumerate()
                .map(|(column, name)| format!("{name} ({})", column + 1))
                .collect::<Vec<_>>()
                .join(", ")
        }
    }

    /// Trials with a full image row, in ascending sweep order.
    fn usable_trials<'a>(&self, artifacts: &'a [TrialArtifacts]) -> Vec<&'a TrialArtifacts> {
        let mut trials: Vec<&TrialArtifacts> = artifacts
            .iter()
            .filter(|trial| {
                let usable = trial.is_complete() && trial.image_paths.len() == self.vehicles.len();
                if !usable {
                    warn!(index = trial.index, value = %trial.label(), "excluding incomplete trial from report");
                }
                usable
            })
            .collect();
        trials.sort_by(|a, b| {
            a.index
                .cmp(&b.index)
                .then(a.parameter_value.total_cmp(&b.parameter_value))
        });
        trials
    }

    /// Renders trials in ascending sweep order. Trials without a full image
    /// row are left out.
    pub fn render(&self, artifacts: &[TrialArtifacts]) -> String {
        self.render_trials(&self.usable_trials(artifacts))
    }

    fn render_trials(&self, trials: &[&TrialArtifacts]) -> String {
        let legend = self.column_legend();
        let mut out = String::from("#  --- Results --- \n \n");
        out.push_str(&self.config_text);
        out.push('\n');
        out.push_str("## --- Graphs ---\n");

        for trial in trials {
            out.push_str(&format!(
                "{legend} , **slip compliance : {}**  \n",
                trial.label()
            ));
            let row: Vec<String> = trial
                .image_paths
                .iter()
                .map(|path| format!("![image]({}){{width={IMAGE_WIDTH}}}", path.display()))
                .collect();
            out.push_str(&row.join(" "));
            out.push_str(" \\ \n\n");
        }
        out
    }

    /// Writes the report and returns how many trial rows it holds.
    pub fn write(&self, artifacts: &[TrialArtifacts], path: &Path) -> Result<usize, SweepError> {
        let trials = self.usable_trials(artifacts);
        fs::write(path, self.render_trials(&trials))?;
        info!(
            path = %path.display(),
            rows = trials.len(),
            skipped = artifacts.len() - trials.len(),
            "report written"
        );
        Ok(trials.len())
    }
}

fn parse_artifact_value(file_name: &str, label: &str) -> Option<f64> {
    file_name
        .strip_prefix(label)?
        .strip_prefix("_slip_")?
        .strip_suffix(".png")?
        .parse()
        .ok()
}

/// Rebuilds artifact sets from the relocated image names in `dir`.
///
/// Each subject's images are sorted by swept value and paired position by
/// position; a subject with fewer images cuts every row after its last one.
pub fn discover_artifacts(dir: &Path, labels: &[&str]) -> Result<Vec<TrialArtifacts>, SweepError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }

    let columns: Vec<Vec<(f64, PathBuf)>> = labels
        .iter()
        .map(|label| {
            let mut found: Vec<(f64, PathBuf)> = names
                .iter()
                .filter_map(|name| parse_artifact_value(name, label).map(|value| (value, dir.join(name))))
                .collect();
            found.sort_by(|a, b| a.0.total_cmp(&b.0));
            debug!(subject = label, images = found.len(), "discovered artifacts");
            found
        })
        .collect();

    let rows = columns.iter().map(Vec::len).min().unwrap_or(0);
    if columns.iter().any(|column| column.len() != rows) {
        let counts: Vec<usize> = columns.iter().map(Vec::len).collect();
        warn!(?counts, rows, "subjects have different image counts, truncating");
    }

    Ok((0..rows)
        .map(|index| TrialArtifacts {
            index,
            parameter_value: columns[0][index].0,
            image_paths: columns.iter().map(|column| column[index].1.clone()).collect(),
            missing: Vec::new(),
        })
        .collect())
}

/// Artifacts of a finished working directory: from its manifest when one
/// exists, otherwise by file name discovery.
pub fn collect_artifacts(workdir: &Path, labels: &[&str]) -> Result<Vec<TrialArtifacts>, SweepError> {
    if workdir.join(MANIFEST_FILE).is_file() {
        let summary = SweepSummary::load_manifest(workdir)?;
        debug!(trials = summary.trials.len(), "using sweep manifest");
        return Ok(summary.completed_artifacts());
    }
    discover_artifacts(workdir, labels)
}

/// External Markdown converter, `pandoc <report> -o <report>.html` by default.
#[derive(Debug, Clone)]
pub struct DocumentConverter {
    program: String,
    extension: String,
}

impl Default for DocumentConverter {
    fn default() -> Self {
        Self {
            program: "pandoc".to_string(),
            extension: "html".to_string(),
        }
    }
}

impl DocumentConverter {
    pub fn new(program: &str, extension: &str) -> Self {
        Self {
            program: program.to_string(),
            extension: extension.to_string(),
        }
    }

    pub fn output_path(&self, report: &Path) -> PathBuf {
        report.with_extension(&self.extension)
    }

    pub fn convert(&self, report: &Path) -> Result<PathBuf, SweepError> {
        let output = self.output_path(report);
        let status = Command::new(&self.program)
            .arg(report)
            .arg("-o")
            .arg(&output)
            .status()
            .map_err(|source| SweepError::Launch {
                label: self.program.clone(),
                source,
            })?;
        if !status.success() {
            return Err(SweepError::Io(std::io::Error::other(format!(
                "{} exited with {status}",
                self.program
            ))));
        }
        info!(path = %output.display(), "report converted");
        Ok(output)
    }
}
