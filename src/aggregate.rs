//! Live force-response aggregation for one tracked subject.
//!
//! Commands arrive sparsely, responses densely, with no ordering guarantee
//! between the two streams. After every command change the next
//! `drop_points` tracked responses are discarded while the system settles;
//! later responses are paired with the latest command. On each new command
//! the pairs are regrouped by command value and the per-bucket mean curve is
//! recomputed and persisted.

use std::collections::BTreeMap;

use crossbeam_channel::Receiver;
use tracing::{debug, info, warn};

use crate::telemetry::{CommandSample, ObservationPair, ResponseSample, TelemetryEvent};
use crate::SweepError;

/// Response samples between two rate-limited live redraws.
pub const REDRAW_THRESHOLD: u32 = 400;

/// How command values are considered equal when bucketing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolution {
    /// Bit-for-bit equality (after folding -0.0 into 0.0).
    Exact,
    /// Values rounding to the same multiple of the quantum share a bucket.
    Quantum(f64),
}

impl Resolution {
    /// A quantum resolution, or `Exact` for quanta that are not finite and positive.
    pub fn quantum(quantum: f64) -> Self {
        if quantum.is_finite() && quantum > 0.0 {
            Resolution::Quantum(quantum)
        } else {
            Resolution::Exact
        }
    }

    fn key(&self, value: f64) -> BucketKey {
        match *self {
            Resolution::Exact => BucketKey::Exact((value + 0.0).to_bits()),
            Resolution::Quantum(quantum) => BucketKey::Quantized((value / quantum).round() as i64),
        }
    }
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Quantum(1e-3)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum BucketKey {
    Exact(u64),
    Quantized(i64),
}

/// Paired responses sharing one command value.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    /// Command value of the first pair that opened the bucket
    pub command: f64,
    pub responses: Vec<f64>,
    mean: f64,
}

impl Bucket {
    fn new(command: f64) -> Self {
        Self {
            command,
            responses: Vec::new(),
            mean: 0.0,
        }
    }

    fn push(&mut self, response: f64) {
        self.responses.push(response);
        self.mean += (response - self.mean) / self.responses.len() as f64;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CurvePoint {
    pub command: f64,
    pub mean: f64,
    pub count: usize,
}

/// Groups pairs into buckets, ordered by ascending command value.
pub fn group_pairs(pairs: &[ObservationPair], resolution: Resolution) -> Vec<Bucket> {
    let mut buckets: BTreeMap<BucketKey, Bucket> = BTreeMap::new();
    for pair in pairs {
        let command = pair.command.value();
        buckets
            .entry(resolution.key(command))
            .or_insert_with(|| Bucket::new(command))
            .push(pair.response.value);
    }

    let mut grouped: Vec<Bucket> = buckets.into_values().collect();
    grouped.sort_by(|a, b| a.command.total_cmp(&b.command));
    grouped
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseOutcome {
    /// The sample was for the tracked subject
    pub tracked: bool,
    /// The sample was paired with the latest command
    pub paired: bool,
    /// A rate-limited live redraw is due
    pub redraw: bool,
}

#[derive(Debug, Clone)]
pub struct SampleAggregator {
    subject: String,
    drop_points: u32,
    resolution: Resolution,
    last_command: Option<CommandSample>,
    since_change: u32,
    since_redraw: u32,
    pairs: Vec<ObservationPair>,
    curve: Vec<CurvePoint>,
}

impl SampleAggregator {
    pub fn new(subject: &str, drop_points: u32, resolution: Resolution) -> Self {
        Self {
            subject: subject.to_string(),
            drop_points,
            resolution,
            last_command: None,
            since_change: 0,
            since_redraw: 0,
            pairs: Vec::new(),
            curve: Vec::new(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn last_command(&self) -> Option<&CommandSample> {
        self.last_command.as_ref()
    }

    pub fn since_change(&self) -> u32 {
        self.since_change
    }

    pub fn pairs(&self) -> &[ObservationPair] {
        &self.pairs
    }

    pub fn curve(&self) -> &[CurvePoint] {
        &self.curve
    }

    /// Raw `(command, response)` points for the scatter plot.
    pub fn scatter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.pairs
            .iter()
            .map(|pair| (pair.command.value(), pair.response.value))
    }

    /// Records a new command step. Returns whether the curve was recomputed.
    pub fn on_command(&mut self, sample: CommandSample) -> bool {
        self.last_command = Some(sample);
        self.since_change = 0;
        info!(subject = %self.subject, "{} data pairs stored", self.pairs.len());
        self.recompute()
    }

    pub fn on_response(&mut self, sample: ResponseSample) -> ResponseOutcome {
        let mut outcome = ResponseOutcome::default();

        if sample.subject == self.subject {
            outcome.tracked = true;
            self.since_change = self.since_change.saturating_add(1);
            if let Some(command) = self.last_command {
                if self.since_change > self.drop_points {
                    self.pairs.push(ObservationPair {
                        command,
                        response: sample,
                    });
                    outcome.paired = true;
                }
            }
        }

        self.since_redraw += 1;
        if self.since_redraw > REDRAW_THRESHOLD {
            self.since_redraw = 0;
            outcome.redraw = true;
        }

        outcome
    }

    /// Regroups every pair and refreshes the mean curve. No-op without pairs.
    pub fn recompute(&mut self) -> bool {
        if self.pairs.is_empty() {
            return false;
        }
        self.curve = group_pairs(&self.pairs, self.resolution)
            .iter()
            .map(|bucket| CurvePoint {
                command: bucket.command,
                mean: bucket.mean(),
                count: bucket.len(),
            })
            .collect();
        true
    }

    pub fn view(&self) -> CurveView<'_> {
        CurveView {
            subject: &self.subject,
            pairs: &self.pairs,
            curve: &self.curve,
        }
    }
}

/// Read-only snapshot handed to a [`CurveSink`].
#[derive(Debug, Clone, Copy)]
pub struct CurveView<'a> {
    pub subject: &'a str,
    pub pairs: &'a [ObservationPair],
    pub curve: &'a [CurvePoint],
}

impl CurveView<'_> {
    pub fn scatter(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.pairs
            .iter()
            .map(|pair| (pair.command.value(), pair.response.value))
    }
}

/// Where the live curve goes: a cheap rate-limited refresh, and a persisted
/// image after every recompute.
pub trait CurveSink {
    fn redraw(&mut self, view: CurveView<'_>) -> Result<(), SweepError>;
    fn persist(&mut self, view: CurveView<'_>) -> Result<(), SweepError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregationSummary {
    pub commands: u64,
    pub responses: u64,
    pub pairs: usize,
    pub buckets: usize,
}

/// Sole owner of one subject's aggregation state, fed through a single channel.
pub struct AggregationTask<S> {
    aggregator: SampleAggregator,
    sink: S,
    commands: u64,
    responses: u64,
}

impl<S: CurveSink> AggregationTask<S> {
    pub fn new(aggregator: SampleAggregator, sink: S) -> Self {
        Self {
            aggregator,
            sink,
            commands: 0,
            responses: 0,
        }
    }

    pub fn aggregator(&self) -> &SampleAggregator {
        &self.aggregator
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn handle(&mut self, event: TelemetryEvent) -> Result<(), SweepError> {
        match event {
            TelemetryEvent::Command(sample) => {
                self.commands += 1;
                if self.aggregator.on_command(sample) {
                    self.sink.persist(self.aggregator.view())?;
                }
            }
            TelemetryEvent::Response(sample) => {
                self.responses += 1;
                if self.aggregator.on_response(sample).redraw {
                    self.sink.redraw(self.aggregator.view())?;
                }
            }
        }
        Ok(())
    }

    /// Recomputes and persists one last time once the input is exhausted.
    pub fn finish(&mut self) -> Result<AggregationSummary, SweepError> {
        if self.aggregator.recompute() {
            self.sink.persist(self.aggregator.view())?;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> AggregationSummary {
        AggregationSummary {
            commands: self.commands,
            responses: self.responses,
            pairs: self.aggregator.pairs().len(),
            buckets: self.aggregator.curve().len(),
        }
    }

    /// Drains `rx` until every sender is dropped.
    ///
    /// A failing sink is logged and does not stop aggregation.
    pub fn run(mut self, rx: Receiver<TelemetryEvent>) -> Result<AggregationSummary, SweepError> {
        for event in rx.iter() {
            if let Err(err) = self.handle(event) {
                warn!(subject = %self.aggregator.subject(), "curve sink failed: {err}");
            }
        }
        let summary = self.finish()?;
        debug!(?summary, "telemetry stream ended");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn command(force_x: f64, order: u64) -> CommandSample {
        CommandSample {
            force: [force_x, 0.0, 0.0],
            arrival_order: order,
        }
    }

    fn response(subject: &str, value: f64, order: u64) -> ResponseSample {
        ResponseSample {
            subject: subject.to_string(),
            value,
            arrival_order: order,
        }
    }

    fn pair(force_x: f64, value: f64) -> ObservationPair {
        ObservationPair {
            command: command(force_x, 0),
            response: response("w", value, 1),
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        redraws: usize,
        persisted: Vec<Vec<CurvePoint>>,
    }

    impl CurveSink for RecordingSink {
        fn redraw(&mut self, _view: CurveView<'_>) -> Result<(), SweepError> {
            self.redraws += 1;
            Ok(())
        }

        fn persist(&mut self, view: CurveView<'_>) -> Result<(), SweepError> {
            self.persisted.push(view.curve.to_vec());
            Ok(())
        }
    }

    #[test]
    fn bucket_means_at_zero_tolerance() {
        let pairs = [pair(10.0, 0.1), pair(10.0, 0.2), pair(10.0, 0.3), pair(20.0, 0.4)];
        let buckets = group_pairs(&pairs, Resolution::Exact);
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].command, 10.0);
        assert_eq!(buckets[0].len(), 3);
        assert!((buckets[0].mean() - 0.2).abs() < 1e-12);
        assert_eq!(buckets[1].command, 20.0);
        assert!((buckets[1].mean() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn quantum_merges_rounding_noise() {
        let pairs = [pair(0.1 + 0.2, 1.0), pair(0.3, 3.0), pair(-0.0, 5.0), pair(0.0, 7.0)];
        let exact = group_pairs(&pairs, Resolution::Exact);
        assert_eq!(exact.len(), 3);

        let quantized = group_pairs(&pairs, Resolution::quantum(1e-3));
        assert_eq!(quantized.len(), 2);
        assert_eq!(quantized[0].mean(), 6.0);
        assert_eq!(quantized[1].mean(), 2.0);
    }

    #[test]
    fn buckets_are_sorted_by_command() {
        let pairs = [pair(30.0, 0.3), pair(-10.0, -0.1), pair(0.0, 0.0)];
        let commands: Vec<f64> = group_pairs(&pairs, Resolution::default())
            .iter()
            .map(|bucket| bucket.command)
            .collect();
        assert_eq!(commands, vec![-10.0, 0.0, 30.0]);
    }

    #[test]
    fn non_positive_quantum_falls_back_to_exact() {
        assert_eq!(Resolution::quantum(0.0), Resolution::Exact);
        assert_eq!(Resolution::quantum(f64::NAN), Resolution::Exact);
    }

    #[test]
    fn responses_before_any_command_are_not_paired() {
        let mut agg = SampleAggregator::new("w", 0, Resolution::Exact);
        for order in 0..5 {
            assert!(!agg.on_response(response("w", 0.1, order)).paired);
        }
        assert!(agg.pairs().is_empty());
    }

    #[test]
    fn drop_points_discard_settling_samples() {
        let mut agg = SampleAggregator::new("w", 2, Resolution::Exact);
        agg.on_command(command(10.0, 0));
        let paired: Vec<bool> = (1..=4)
            .map(|order| agg.on_response(response("w", 0.5, order)).paired)
            .collect();
        assert_eq!(paired, vec![false, false, true, true]);

        agg.on_command(command(20.0, 5));
        assert_eq!(agg.since_change(), 0);
        assert!(!agg.on_response(response("w", 0.6, 6)).paired);
        assert_eq!(agg.pairs().len(), 2);
        assert!(agg.pairs().iter().all(|p| p.command.value() == 10.0));
    }

    #[test]
    fn untracked_subject_is_ignored() {
        let mut agg = SampleAggregator::new("wheel_rear_left", 0, Resolution::Exact);
        agg.on_command(command(10.0, 0));
        let outcome = agg.on_response(response("wheel_front", 0.5, 1));
        assert!(!outcome.tracked);
        assert!(!outcome.paired);
        assert_eq!(agg.since_change(), 0);
        assert!(agg.pairs().is_empty());
    }

    #[test]
    fn redraw_is_rate_limited() {
        let mut agg = SampleAggregator::new("w", 0, Resolution::Exact);
        let redraws: Vec<u64> = (0..(2 * (REDRAW_THRESHOLD as u64 + 1)))
            .filter(|&order| agg.on_response(response("other", 0.0, order)).redraw)
            .collect();
        assert_eq!(redraws, vec![REDRAW_THRESHOLD as u64, 2 * REDRAW_THRESHOLD as u64 + 1]);
    }

    #[test]
    fn recompute_without_pairs_draws_nothing() {
        let mut agg = SampleAggregator::new("w", 0, Resolution::Exact);
        assert!(!agg.on_command(command(10.0, 0)));
        assert!(agg.curve().is_empty());
    }

    #[test]
    fn task_persists_on_each_command_with_pairs() {
        let agg = SampleAggregator::new("w", 1, Resolution::default());
        let mut task = AggregationTask::new(agg, RecordingSink::default());

        let events = vec![
            TelemetryEvent::Command(command(0.0, 0)),
            TelemetryEvent::Response(response("w", 0.0, 1)),
            TelemetryEvent::Response(response("w", 0.02, 2)),
            TelemetryEvent::Response(response("w", 0.04, 3)),
            TelemetryEvent::Command(command(10.0, 4)),
            TelemetryEvent::Response(response("w", 0.5, 5)),
            TelemetryEvent::Response(response("w", 0.3, 6)),
            TelemetryEvent::Response(response("w", 0.1, 7)),
        ];
        let (tx, rx) = crossbeam_channel::unbounded();
        for event in events {
            tx.send(event).unwrap();
        }
        drop(tx);

        task.handle(rx.recv().unwrap()).unwrap();
        assert!(task.sink().persisted.is_empty());
        for event in rx.try_iter() {
            task.handle(event).unwrap();
        }
        let summary = task.finish().unwrap();

        assert_eq!(summary.commands, 2);
        assert_eq!(summary.responses, 6);
        assert_eq!(summary.pairs, 4);
        assert_eq!(summary.buckets, 2);

        let persisted = &task.sink().persisted;
        assert_eq!(persisted.len(), 2);
        assert_eq!(persisted[0].len(), 1);
        assert_eq!(persisted[0][0].count, 2);
        assert!((persisted[0][0].mean - 0.03).abs() < 1e-12);
        let last = persisted.last().unwrap();
        assert_eq!(last[1].command, 10.0);
        assert!((last[1].mean - 0.2).abs() < 1e-12);
    }

    #[test]
    fn run_drains_channel_until_closed() {
        let agg = SampleAggregator::new("w", 0, Resolution::Exact);
        let task = AggregationTask::new(agg, RecordingSink::default());
        let (tx, rx) = crossbeam_channel::bounded(16);
        let producer = std::thread::spawn(move || {
            tx.send(TelemetryEvent::Command(command(5.0, 0))).unwrap();
            for order in 1..=3 {
                tx.send(TelemetryEvent::Response(response("w", 1.0, order))).unwrap();
            }
        });
        let summary = task.run(rx).unwrap();
        producer.join().unwrap();
        assert_eq!(summary.pairs, 3);
        assert_eq!(summary.buckets, 1);
    }

    proptest! {
        #[test]
        fn pairing_follows_debounce_under_any_interleaving(
            events in proptest::collection::vec(any::<bool>(), 0..200),
            drop_points in 0u32..6,
        ) {
            let mut agg = SampleAggregator::new("w", drop_points, Resolution::Exact);
            let mut seen_command = false;
            let mut since_change = 0u32;

            for (order, is_command) in events.into_iter().enumerate() {
                if is_command {
                    agg.on_command(command(order as f64, order as u64));
                    seen_command = true;
                    since_change = 0;
                } else {
                    since_change += 1;
                    let expected = seen_command && since_change >= drop_points + 1;
                    let outcome = agg.on_response(response("w", 0.1, order as u64));
                    prop_assert_eq!(outcome.paired, expected);
                }
            }
        }
    }
}
