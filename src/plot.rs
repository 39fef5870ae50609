use std::fs;
use std::path::{Path, PathBuf};

use plotters::prelude::*;
use tracing::debug;

use crate::aggregate::{CurvePoint, CurveSink, CurveView};
use crate::config::DisplayLimits;
use crate::SweepError;

/// Name of the image a response-collecting worker writes for `vehicle`.
pub fn plot_file_name(vehicle: &str) -> String {
    format!("{vehicle}_plot.png")
}

fn plot_err<E: std::fmt::Display>(err: E) -> SweepError {
    SweepError::Plot(err.to_string())
}

fn within(limits: &DisplayLimits, x: f64, y: f64) -> bool {
    x.abs() <= limits.xlim && y.abs() <= limits.ylim
}

/// Scatter points inside the plotted area.
pub fn visible_scatter<'a>(
    view: &'a CurveView<'a>,
    limits: &'a DisplayLimits,
) -> impl Iterator<Item = (f64, f64)> + 'a {
    view.scatter().filter(move |&(x, y)| within(limits, x, y))
}

pub fn visible_means<'a>(
    curve: &'a [CurvePoint],
    limits: &'a DisplayLimits,
) -> impl Iterator<Item = &'a CurvePoint> + 'a {
    curve
        .iter()
        .filter(move |point| within(limits, point.command, point.mean))
}

/// Renders raw pairs as dots and bucket means as red crosses.
pub fn render_curve(
    path: &Path,
    title: &str,
    limits: &DisplayLimits,
    view: &CurveView<'_>,
) -> Result<(), SweepError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let root = BitMapBackend::new(path, (1024, 768)).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;

    let mut chart = ChartBuilder::on(&root)
        .caption(title, ("sans-serif", 28).into_font())
        .margin(20)
        .x_label_area_size(50)
        .y_label_area_size(70)
        .build_cartesian_2d(-limits.xlim..limits.xlim, -limits.ylim..limits.ylim)
        .map_err(plot_err)?;

    chart
        .configure_mesh()
        .x_desc("Drawbar pull force (N)")
        .y_desc("Longitudinal wheel slip")
        .draw()
        .map_err(plot_err)?;

    chart
        .draw_series(
            visible_scatter(view, limits).map(|(x, y)| Circle::new((x, y), 2, BLUE.filled())),
        )
        .map_err(plot_err)?;

    chart
        .draw_series(
            visible_means(view.curve, limits)
                .map(|point| Cross::new((point.command, point.mean), 6, RED.stroke_width(2))),
        )
        .map_err(plot_err)?;

    root.present().map_err(plot_err)?;
    Ok(())
}

/// Curve sink of the response-collecting worker.
#[derive(Debug, Clone)]
pub struct PlotSink {
    path: PathBuf,
    title: String,
    limits: DisplayLimits,
    rendered: usize,
}

impl PlotSink {
    pub fn new(output_dir: &Path, vehicle: &str, wheel: &str, limits: DisplayLimits) -> Self {
        Self {
            path: output_dir.join(plot_file_name(vehicle)),
            title: format!("Wheel slip vs drawbar pull - {wheel}"),
            limits,
            rendered: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn rendered(&self) -> usize {
        self.rendered
    }
}

impl CurveSink for PlotSink {
    fn redraw(&mut self, view: CurveView<'_>) -> Result<(), SweepError> {
        debug!(
            subject = view.subject,
            pairs = view.pairs.len(),
            buckets = view.curve.len(),
            "live refresh"
        );
        Ok(())
    }

    fn persist(&mut self, view: CurveView<'_>) -> Result<(), SweepError> {
        render_curve(&self.path, &self.title, &self.limits, &view)?;
        self.rendered += 1;
        debug!(path = %self.path.display(), "curve image written");
        Ok(())
    }
}
