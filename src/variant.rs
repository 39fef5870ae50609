//! Scenario variants over the slip compliance sweep.
//!
//! A scenario template marks every substitution point with a named
//! placeholder such as `{{slip_compliance_lateral}}`. Rendering looks each
//! placeholder up by name, so edits elsewhere in the template cannot shift
//! what gets replaced.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::SweepError;

/// First swept value; kept above zero so no variant gets a degenerate compliance.
pub const SWEEP_START: f64 = 0.01;

/// Placeholders that receive the swept value.
pub const COMPLIANCE_PLACEHOLDERS: [&str; 2] =
    ["slip_compliance_lateral", "slip_compliance_longitudinal"];

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepSpec {
    pub start: f64,
    pub step: f64,
    pub max: f64,
}

impl SweepSpec {
    pub fn new(start: f64, step: f64, max: f64) -> Self {
        Self { start, step, max }
    }

    /// Swept values `start + i * step` strictly below `max`.
    ///
    /// Each value is computed from its index rather than accumulated, and a
    /// value within a relative epsilon of `max` counts as reaching it.
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        let epsilon = self.step.abs() * 1e-9;
        (0_usize..)
            .map(move |idx| self.start + idx as f64 * self.step)
            .take_while(move |value| self.step > 0.0 && *value < self.max - epsilon)
    }

    pub fn len(&self) -> usize {
        self.values().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Smallest step whose values still get distinct labels from [`format_value`].
pub const LABEL_RESOLUTION: f64 = 1e-6;

/// Deterministic text form of a swept value: at most six decimals, no trailing zeros.
pub fn format_value(value: f64) -> String {
    let text = format!("{value:.6}");
    let trimmed = text.trim_end_matches('0').trim_end_matches('.');
    match trimmed {
        "" | "-0" => "0".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioTemplate {
    segments: Vec<Segment>,
}

impl ScenarioTemplate {
    pub fn parse(source: &str) -> Result<Self, SweepError> {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(open) = rest.find(OPEN) {
            if open > 0 {
                segments.push(Segment::Text(rest[..open].to_string()));
            }
            let after_open = &rest[open + OPEN.len()..];
            let close = after_open.find(CLOSE).ok_or_else(|| {
                SweepError::Template("unterminated placeholder".to_string())
            })?;
            let name = after_open[..close].trim();
            if !COMPLIANCE_PLACEHOLDERS.contains(&name) {
                return Err(SweepError::Template(format!("unknown placeholder {{{{{name}}}}}")));
            }
            segments.push(Segment::Placeholder(name.to_string()));
            rest = &after_open[close + CLOSE.len()..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        let template = Self { segments };
        if template.placeholder_count() == 0 {
            return Err(SweepError::Template(
                "template contains no slip compliance placeholder".to_string(),
            ));
        }
        Ok(template)
    }

    pub fn load(path: &Path) -> Result<Self, SweepError> {
        let source = fs::read_to_string(path).map_err(|err| {
            SweepError::Template(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::parse(&source)
    }

    pub fn placeholder_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Placeholder(_)))
            .count()
    }

    pub fn render(&self, value: f64) -> String {
        let value_text = format_value(value);
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(_) => out.push_str(&value_text),
            }
        }
        out
    }
}

/// One rendered scenario instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub index: usize,
    pub parameter_value: f64,
    pub source_path: PathBuf,
}

impl Variant {
    pub fn label(&self) -> String {
        format_value(self.parameter_value)
    }
}

#[derive(Debug, Clone)]
pub struct VariantGenerator {
    template: ScenarioTemplate,
    spec: SweepSpec,
    output_dir: PathBuf,
    extension: String,
}

impl VariantGenerator {
    pub fn new(template: ScenarioTemplate, spec: SweepSpec, output_dir: &Path) -> Self {
        Self {
            template,
            spec,
            output_dir: output_dir.to_path_buf(),
            extension: "world".to_string(),
        }
    }

    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_string();
        self
    }

    pub fn spec(&self) -> &SweepSpec {
        &self.spec
    }

    pub fn scenario_path(&self, value: f64) -> PathBuf {
        self.output_dir
            .join(format!("slip_{}.{}", format_value(value), self.extension))
    }

    /// Lazily renders one variant per swept value; call again to restart.
    pub fn variants(&self) -> impl Iterator<Item = Result<Variant, SweepError>> + '_ {
        self.spec
            .values()
            .enumerate()
            .map(move |(index, value)| self.render_variant(index, value))
    }

    /// Writes the scenario for the `index`-th swept `value`.
    pub fn render_variant(&self, index: usize, value: f64) -> Result<Variant, SweepError> {
        let path = self.scenario_path(value);
        fs::write(&path, self.template.render(value))?;
        debug!(index, value, path = %path.display(), "rendered scenario variant");
        Ok(Variant {
            index,
            parameter_value: value,
            source_path: path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = "\
<surface>
  <slip_compliance_lateral>{{slip_compliance_lateral}}</slip_compliance_lateral>
  <slip_compliance_longitudinal>{{ slip_compliance_longitudinal }}</slip_compliance_longitudinal>
  <mu>0.0</mu><mu2>10</mu2>
</surface>
";

    #[test]
    fn sweep_enumerates_values_below_max() {
        let spec = SweepSpec::new(0.01, 0.02, 0.07);
        let labels: Vec<String> = spec.values().map(format_value).collect();
        assert_eq!(labels, ["0.01", "0.03", "0.05"]);
        assert!(spec.values().all(|value| value < 0.07));
        assert_eq!(spec.len(), 3);
    }

    #[test]
    fn sweep_with_non_positive_step_is_empty() {
        assert!(SweepSpec::new(0.01, 0.0, 0.07).is_empty());
        assert!(SweepSpec::new(0.01, -0.02, 0.07).is_empty());
    }

    #[test]
    fn format_value_trims_zeros() {
        assert_eq!(format_value(0.05), "0.05");
        assert_eq!(format_value(0.030000000000000002), "0.03");
        assert_eq!(format_value(2.0), "2");
        assert_eq!(format_value(0.0), "0");
        assert_eq!(format_value(-0.0), "0");
    }

    #[test]
    fn render_replaces_only_placeholders() {
        let template = ScenarioTemplate::parse(TEMPLATE).unwrap();
        assert_eq!(template.placeholder_count(), 2);
        let rendered = template.render(0.03);
        assert!(rendered.contains("<slip_compliance_lateral>0.03</slip_compliance_lateral>"));
        assert!(rendered.contains("<slip_compliance_longitudinal>0.03</slip_compliance_longitudinal>"));
        // Literal zeros on the same lines stay untouched.
        assert!(rendered.contains("<mu>0.0</mu><mu2>10</mu2>"));
    }

    #[test]
    fn parse_rejects_unknown_and_missing_placeholders() {
        assert!(matches!(
            ScenarioTemplate::parse("{{friction}}"),
            Err(SweepError::Template(_))
        ));
        assert!(matches!(
            ScenarioTemplate::parse("<world/>"),
            Err(SweepError::Template(_))
        ));
        assert!(matches!(
            ScenarioTemplate::parse("{{slip_compliance_lateral"),
            Err(SweepError::Template(_))
        ));
    }

    #[test]
    fn generator_writes_one_file_per_value() {
        let dir = tempfile::tempdir().unwrap();
        let template = ScenarioTemplate::parse(TEMPLATE).unwrap();
        let generator =
            VariantGenerator::new(template, SweepSpec::new(0.01, 0.02, 0.07), dir.path());

        let variants: Vec<Variant> = generator.variants().collect::<Result<_, _>>().unwrap();
        assert_eq!(variants.len(), 3);
        assert_eq!(variants[2].index, 2);
        assert_eq!(variants[1].source_path, dir.path().join("slip_0.03.world"));
        for variant in &variants {
            let text = fs::read_to_string(&variant.source_path).unwrap();
            assert!(text.contains(&variant.label()));
        }
    }

    #[test]
    fn generator_output_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let template = ScenarioTemplate::parse(TEMPLATE).unwrap();
        let generator =
            VariantGenerator::new(template, SweepSpec::new(0.01, 0.02, 0.07), dir.path());

        let first: Vec<Vec<u8>> = generator
            .variants()
            .map(|variant| fs::read(variant.unwrap().source_path).unwrap())
            .collect();
        let second: Vec<Vec<u8>> = generator
            .variants()
            .map(|variant| fs::read(variant.unwrap().source_path).unwrap())
            .collect();
        assert_eq!(first, second);
    }
}
