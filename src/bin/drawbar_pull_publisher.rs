use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use slip_sweep::telemetry::WireMessage;
use slip_sweep::ForceSchedule;
use tracing::info;

/// Steps the drawbar pull up to +max, then down to -max, one level per interval.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Force step between levels [N]
    #[arg(long, default_value_t = 10.0)]
    force_increment: f64,

    /// Hold time of each level [s]
    #[arg(long, default_value_t = 2.0)]
    interval: f64,

    /// Largest force magnitude [N]
    #[arg(long, default_value_t = 100.0)]
    max_force: f64,

    /// Telemetry output (JSON lines); stdout when omitted
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    anyhow::ensure!(cli.force_increment > 0.0, "--force-increment must be positive");
    anyhow::ensure!(cli.max_force > 0.0, "--max-force must be positive");
    anyhow::ensure!(cli.interval > 0.0, "--interval must be positive");

    let mut out: Box<dyn Write> = match &cli.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("failed to create {}", path.display()))?,
        )),
        None => Box::new(io::stdout()),
    };

    let schedule = ForceSchedule::new(cli.force_increment, cli.max_force);
    let hold = Duration::from_secs_f64(cli.interval);
    info!(levels = schedule.len(), interval = cli.interval, "publishing drawbar pull schedule");

    for (step, force) in schedule.enumerate() {
        WireMessage::drawbar_pull(force)
            .write_line(&mut out)
            .context("telemetry output closed")?;
        info!(step, force, "drawbar pull applied");
        thread::sleep(hold);
    }
    Ok(())
}
