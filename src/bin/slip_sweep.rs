use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use slip_sweep::report::{collect_artifacts, DocumentConverter};
use slip_sweep::{
    load_config, prepare_workdir, LoadedConfig, ReportAssembler, ScenarioTemplate, SweepError,
    SweepOrchestrator, SystemSpawner, TrialArtifacts,
};
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(author, version, about = "Wheel-slip vs drawbar-pull slip compliance sweep")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the sweep, then write the report
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Scenario template with {{slip_compliance_*}} placeholders
        #[arg(long, default_value = "worlds/drawbar_pull_demo.world")]
        template: PathBuf,
    },
    /// Rebuild the report from a finished working directory
    Report {
        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Debug, Args)]
struct CommonArgs {
    /// Experiment configuration (YAML)
    #[arg(long, default_value = "config/config.yaml")]
    config: PathBuf,

    /// Working directory for scenarios and relocated images
    #[arg(long, default_value = "temp")]
    workdir: PathBuf,

    /// Markdown report path
    #[arg(long, default_value = "summary.md")]
    report: PathBuf,

    /// Convert the report with pandoc after writing it
    #[arg(long)]
    convert: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match try_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn try_main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run { common, template } => run(&common, &template),
        Commands::Report { common } => {
            let loaded = load(&common.config)?;
            let labels: Vec<&str> = loaded.config.vehicles.iter().map(|v| v.label.as_str()).collect();
            let artifacts = collect_artifacts(&common.workdir, &labels)
                .with_context(|| format!("failed to read artifacts from {}", common.workdir.display()))?;
            write_report(&common, &loaded, &artifacts)
        }
    }
}

fn load(path: &Path) -> anyhow::Result<LoadedConfig> {
    load_config(path).with_context(|| format!("failed to load configuration {}", path.display()))
}

fn run(common: &CommonArgs, template_path: &Path) -> anyhow::Result<()> {
    let loaded = load(&common.config)?;
    let template = ScenarioTemplate::load(template_path)
        .with_context(|| format!("failed to load scenario template {}", template_path.display()))?;
    let workdir = prepare_workdir(&common.workdir)
        .with_context(|| format!("failed to prepare working directory {}", common.workdir.display()))?;

    let abort = Arc::new(AtomicBool::new(false));
    let abort_for_ctrlc = Arc::clone(&abort);
    ctrlc::set_handler(move || {
        abort_for_ctrlc.store(true, Ordering::SeqCst);
    })
    .context("failed to install Ctrl-C handler")?;

    let orchestrator = SweepOrchestrator::from_config(
        &loaded.config,
        template,
        &workdir,
        SystemSpawner::new(&workdir),
        abort,
    );

    let summary = match orchestrator.run() {
        Ok(summary) => summary,
        Err(SweepError::Interrupted) => anyhow::bail!("sweep interrupted, partial manifest kept"),
        Err(err) => return Err(err).context("sweep aborted"),
    };

    info!(
        completed = summary.completed(),
        total = summary.trials.len(),
        "sweep complete"
    );
    write_report(common, &loaded, &summary.completed_artifacts())
}

fn write_report(
    common: &CommonArgs,
    loaded: &LoadedConfig,
    artifacts: &[TrialArtifacts],
) -> anyhow::Result<()> {
    let assembler = ReportAssembler::new(&loaded.raw, &loaded.config.vehicles);
    assembler
        .write(artifacts, &common.report)
        .with_context(|| format!("failed to write report {}", common.report.display()))?;

    if common.convert {
        match DocumentConverter::default().convert(&common.report) {
            Ok(path) => println!("Report: {}", path.display()),
            Err(err) => warn!("report conversion failed, keeping Markdown: {err}"),
        }
    } else {
        println!("Report: {}", common.report.display());
    }
    Ok(())
}
