use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use slip_sweep::config::DisplayLimits;
use slip_sweep::plot::PlotSink;
use slip_sweep::telemetry::spawn_line_reader;
use slip_sweep::{AggregationTask, Resolution, SampleAggregator};
use tracing::{debug, info};

/// Collects drawbar pull commands and wheel slip responses and plots the mean curve.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Response samples dropped after every command change
    #[arg(long, default_value_t = 10)]
    drop_points: u32,

    /// Wheel to track
    #[arg(long, default_value = "wheel_rear_left")]
    name: String,

    /// Horizontal plot half-range [N]
    #[arg(long, default_value_t = 80.0)]
    xlim: f64,

    /// Vertical plot half-range
    #[arg(long, default_value_t = 1.1)]
    ylim: f64,

    /// Output file prefix
    #[arg(long = "vehicle_name", default_value = "NONE")]
    vehicle_name: String,

    /// Commands closer than this share a bucket [N]; 0 groups by exact value
    #[arg(long, default_value_t = 0.001)]
    command_resolution: f64,

    /// Telemetry input (JSON lines); stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,

    /// Directory the plot is written to
    #[arg(long, default_value = ".")]
    output_dir: PathBuf,

    /// Transport remapping arguments, accepted and ignored
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    transport: Vec<String>,
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
    if !cli.transport.is_empty() {
        debug!(args = ?cli.transport, "transport arguments passed through");
    }

    let input: Box<dyn BufRead + Send> = match &cli.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open {}", path.display()))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let limits = DisplayLimits {
        xlim: cli.xlim,
        ylim: cli.ylim,
    };
    let sink = PlotSink::new(&cli.output_dir, &cli.vehicle_name, &cli.name, limits);
    let plot_path = sink.path().to_path_buf();
    let aggregator = SampleAggregator::new(
        &cli.name,
        cli.drop_points,
        Resolution::quantum(cli.command_resolution),
    );

    info!(wheel = %cli.name, vehicle = %cli.vehicle_name, plot = %plot_path.display(), "collecting telemetry");
    let (tx, rx) = crossbeam_channel::unbounded();
    let reader = spawn_line_reader(input, tx);
    let summary = AggregationTask::new(aggregator, sink)
        .run(rx)
        .context("failed to write final plot")?;
    let forwarded = reader
        .join()
        .map_err(|_| anyhow::anyhow!("telemetry reader panicked"))?;

    info!(
        forwarded,
        commands = summary.commands,
        responses = summary.responses,
        pairs = summary.pairs,
        buckets = summary.buckets,
        "telemetry stream ended"
    );
    Ok(())
}
