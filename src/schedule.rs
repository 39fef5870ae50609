//! Trial timing: the deadline every trial waits for, and the drawbar pull
//! levels the command-driving worker steps through within it.

use std::fmt;
use std::time::Duration;

use crate::config::TrialConfig;

/// Wall-clock budget of one trial, `((max / inc) + 2) * interval * 2` seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct TrialDeadline(f64);

impl TrialDeadline {
    pub fn new(force_increment: f64, max_force: f64, interval_secs: f64) -> Self {
        Self(((max_force / force_increment) + 2.0) * interval_secs * 2.0)
    }

    pub fn from_trial(config: &TrialConfig) -> Self {
        Self::new(config.force_increment, config.max_force, config.interval_secs)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.0
    }

    /// `None` when the deadline is negative, not finite, or too long for a [`Duration`].
    pub fn try_as_duration(&self) -> Option<Duration> {
        Duration::try_from_secs_f64(self.0).ok()
    }

    /// Saturates at [`Duration::MAX`]; an invalid deadline never panics here.
    pub fn as_duration(&self) -> Duration {
        if self.0.is_nan() || self.0 <= 0.0 {
            return Duration::ZERO;
        }
        self.try_as_duration().unwrap_or(Duration::MAX)
    }
}

impl fmt::Display for TrialDeadline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1} s", self.0)
    }
}

/// Drawbar pull levels, held for one interval each.
///
/// Two ramps: `0, +inc, ..., +max` then `0, -inc, ..., -max`. A level is only
/// emitted while its magnitude does not exceed `max`, so a `max` that is not a
/// multiple of `inc` stops at the last full step.
#[derive(Debug, Clone)]
pub struct ForceSchedule {
    increment: f64,
    steps_per_ramp: usize,
    position: usize,
}

impl ForceSchedule {
    pub fn new(force_increment: f64, max_force: f64) -> Self {
        let ratio = max_force / force_increment;
        // Tolerate the ratio landing just under an integer.
        let steps = (ratio + 1e-9).floor().max(0.0) as usize;
        Self {
            increment: force_increment,
            steps_per_ramp: steps + 1,
            position: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.steps_per_ramp * 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn level(&self, position: usize) -> Option<f64> {
        if position >= self.len() {
            return None;
        }
        let (sign, step) = if position < self.steps_per_ramp {
            (1.0, position)
        } else {
            (-1.0, position - self.steps_per_ramp)
        };
        // 0 * -1.0 would print as -0.
        if step == 0 {
            return Some(0.0);
        }
        Some(sign * step as f64 * self.increment)
    }
}

impl Iterator for ForceSchedule {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let level = self.level(self.position)?;
        self.position += 1;
        Some(level)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.len().saturating_sub(self.position);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ForceSchedule {}
