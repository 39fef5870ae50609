use std::fs;
use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use slip_sweep::aggregate::CurveView;
use slip_sweep::telemetry::{spawn_line_reader, WireMessage};
use slip_sweep::{
    collect_artifacts, load_config, prepare_workdir, AggregationTask, CommandSpec, CurvePoint,
    CurveSink, ForceSchedule, ManagedProcess, ProcessSpawner, ReportAssembler, Resolution,
    SampleAggregator, ScenarioTemplate, SweepError, SweepOrchestrator, TrialOutcome,
};

const CONFIG: &str = "\
force-increment: 1
max-force: 1
interval: 0.001
slip-increment: 0.02
slip-max: 0.07
drop-points: 2
name: wheel_rear_left
xlim: 80
ylim: 1.1
launch:
  warmup-secs: 0
";

const TEMPLATE: &str = "\
<ode>
  <slip_compliance_lateral>{{slip_compliance_lateral}}</slip_compliance_lateral>
  <slip_compliance_longitudinal>{{slip_compliance_longitudinal}}</slip_compliance_longitudinal>
</ode>
";

#[derive(Default)]
struct Ledger {
    spawned: Vec<String>,
    killed: Vec<String>,
}

/// Pretends to run the workers; each plotter leaves its image in `workdir`.
#[derive(Clone)]
struct FakeWorkers {
    workdir: PathBuf,
    ledger: Arc<Mutex<Ledger>>,
    silent_vehicle: Option<&'static str>,
}

struct FakeProcess {
    label: String,
    ledger: Arc<Mutex<Ledger>>,
}

impl ManagedProcess for FakeProcess {
    fn label(&self) -> &str {
        &self.label
    }

    fn id(&self) -> Option<u32> {
        None
    }

    fn kill(&mut self) -> io::Result<()> {
        self.ledger.lock().unwrap().killed.push(self.label.clone());
        Ok(())
    }
}

impl ProcessSpawner for FakeWorkers {
    fn spawn(&self, spec: &CommandSpec) -> Result<Box<dyn ManagedProcess>, SweepError> {
        if let Some(vehicle) = spec.label.strip_prefix("plotter:") {
            if self.silent_vehicle != Some(vehicle) {
                fs::write(self.workdir.join(format!("{vehicle}_plot.png")), b"png").unwrap();
            }
        }
        self.ledger.lock().unwrap().spawned.push(spec.label.clone());
        Ok(Box::new(FakeProcess {
            label: spec.label.clone(),
            ledger: Arc::clone(&self.ledger),
        }))
    }
}

fn setup(root: &Path) -> (PathBuf, PathBuf) {
    let config = root.join("config.yaml");
    let template = root.join("demo.world");
    fs::write(&config, CONFIG).unwrap();
    fs::write(&template, TEMPLATE).unwrap();
    (config, template)
}

#[test]
fn sweep_produces_ordered_report() {
    let root = tempfile::tempdir().unwrap();
    let (config_path, template_path) = setup(root.path());
    let workdir = root.path().join("temp");
    fs::create_dir_all(&workdir).unwrap();
    fs::write(workdir.join("leftover.png"), b"old").unwrap();

    let loaded = load_config(&config_path).unwrap();
    let template = ScenarioTemplate::load(&template_path).unwrap();
    prepare_workdir(&workdir).unwrap();
    assert!(!workdir.join("leftover.png").exists());

    let workers = FakeWorkers {
        workdir: workdir.clone(),
        ledger: Arc::default(),
        silent_vehicle: None,
    };
    let summary = SweepOrchestrator::from_config(
        &loaded.config,
        template,
        &workdir,
        workers.clone(),
        Arc::new(AtomicBool::new(false)),
    )
    .run()
    .unwrap();

    assert_eq!(summary.completed(), 3);
    let ledger = workers.ledger.lock().unwrap();
    assert_eq!(ledger.spawned.len(), 12);
    let mut spawned = ledger.spawned.clone();
    let mut killed = ledger.killed.clone();
    spawned.sort();
    killed.sort();
    assert_eq!(spawned, killed);

    let world = fs::read_to_string(workdir.join("slip_0.03.world")).unwrap();
    assert!(world.contains("<slip_compliance_lateral>0.03</slip_compliance_lateral>"));
    assert!(!world.contains("{{"));

    let report_path = root.path().join("summary.md");
    ReportAssembler::new(&loaded.raw, &loaded.config.vehicles)
        .write(&summary.completed_artifacts(), &report_path)
        .unwrap();
    let report = fs::read_to_string(&report_path).unwrap();
    assert!(report.starts_with("#  --- Results --- \n \nforce-increment: 1\n"));
    let rows: Vec<&str> = report
        .lines()
        .filter(|line| line.contains("**slip compliance"))
        .collect();
    assert_eq!(rows.len(), 3);
    assert!(rows[0].ends_with("**slip compliance : 0.01**  "));
    assert!(rows[2].ends_with("**slip compliance : 0.05**  "));
}

#[test]
fn report_rebuild_skips_trials_missing_an_image() {
    let root = tempfile::tempdir().unwrap();
    let (config_path, template_path) = setup(root.path());
    let workdir = root.path().join("temp");
    prepare_workdir(&workdir).unwrap();

    let loaded = load_config(&config_path).unwrap();
    let workers = FakeWorkers {
        workdir: workdir.clone(),
        ledger: Arc::default(),
        silent_vehicle: Some("cycle1"),
    };
    let summary = SweepOrchestrator::from_config(
        &loaded.config,
        ScenarioTemplate::load(&template_path).unwrap(),
        &workdir,
        workers,
        Arc::default(),
    )
    .run()
    .unwrap();

    assert!(summary
        .trials
        .iter()
        .all(|trial| matches!(trial, TrialOutcome::Incomplete(a) if a.missing == ["cycle1"])));
    assert!(collect_artifacts(&workdir, &["cycle0", "cycle1"]).unwrap().is_empty());

    fs::remove_file(workdir.join(slip_sweep::MANIFEST_FILE)).unwrap();
    assert!(collect_artifacts(&workdir, &["cycle0", "cycle1"]).unwrap().is_empty());
}

#[test]
fn missing_config_key_is_a_config_error() {
    let root = tempfile::tempdir().unwrap();
    let path = root.path().join("config.yaml");
    fs::write(&path, CONFIG.replace("max-force: 1\n", "")).unwrap();
    let err = load_config(&path).unwrap_err();
    assert!(matches!(err, SweepError::Config(_)));
    assert!(err.is_fatal());
}

#[derive(Clone, Default)]
struct CapturedCurve {
    last: Arc<Mutex<Vec<CurvePoint>>>,
}

impl CurveSink for CapturedCurve {
    fn redraw(&mut self, _view: CurveView<'_>) -> Result<(), SweepError> {
        Ok(())
    }

    fn persist(&mut self, view: CurveView<'_>) -> Result<(), SweepError> {
        *self.last.lock().unwrap() = view.curve.to_vec();
        Ok(())
    }
}

#[test]
fn published_schedule_aggregates_into_mean_curve() {
    let mut wire = Vec::new();
    for force in ForceSchedule::new(10.0, 20.0) {
        WireMessage::drawbar_pull(force).write_line(&mut wire).unwrap();
        // Two settling samples, then two that count.
        for slip in [0.9, 0.9, force / 100.0, force / 100.0 + 0.02] {
            WireMessage::Response {
                subject: "wheel_rear_left".to_string(),
                value: slip,
            }
            .write_line(&mut wire)
            .unwrap();
        }
        WireMessage::Response {
            subject: "wheel_front".to_string(),
            value: 5.0,
        }
        .write_line(&mut wire)
        .unwrap();
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let reader = spawn_line_reader(Cursor::new(wire), tx);
    let aggregator = SampleAggregator::new("wheel_rear_left", 2, Resolution::default());
    let sink = CapturedCurve::default();
    let summary = AggregationTask::new(aggregator, sink.clone()).run(rx).unwrap();

    assert_eq!(reader.join().unwrap(), 36);
    assert_eq!(summary.commands, 6);
    // 0, 10, 20, then 0 again, -10, -20.
    assert_eq!(summary.pairs, 12);
    assert_eq!(summary.buckets, 5);

    let curve = sink.last.lock().unwrap();
    let commands: Vec<f64> = curve.iter().map(|point| point.command).collect();
    assert_eq!(commands, [-20.0, -10.0, 0.0, 10.0, 20.0]);
    assert_eq!(curve[2].count, 4);
    assert!((curve[2].mean - 0.01).abs() < 1e-12);
    assert!((curve[3].mean - 0.11).abs() < 1e-12);
}
