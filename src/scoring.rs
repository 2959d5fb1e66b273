use crate::prompts::Rubric;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Bounded numeric result of judging one candidate against one reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scorecard {
    /// Base dimension scores, keyed by dimension name
    #[serde(flatten)]
    pub dimensions: BTreeMap<String, f64>,
    pub overall: f64,
}

impl Scorecard {
    pub fn get(&self, name: &str) -> Option<f64> {
        if name == "overall" {
            Some(self.overall)
        } else {
            self.dimensions.get(name).copied()
        }
    }

    /// All entries including `overall`
    pub fn entries(&self) -> impl Iterator<Item = (&str, f64)> {
        self.dimensions
            .iter()
            .map(|(name, score)| (name.as_str(), *score))
            .chain(std::iter::once(("overall", self.overall)))
    }
}

/// Multiplier applied to `"n/d"` fractions, whatever the rubric range
const FRACTION_SCALE: f64 = 10.0;

/// Convert one raw score field to a float.
///
/// `"n/d"` strings become `(n/d) * 10`; anything unparseable becomes 0.0. Callers clamp to
/// the rubric range afterwards.
pub fn to_float(value: Option<&Value>) -> f64 {
    let converted = match value {
        Some(Value::Number(number)) => number.as_f64(),
        Some(Value::String(text)) => match text.split_once('/') {
            Some((numerator, denominator)) => {
                match (
                    numerator.trim().parse::<f64>(),
                    denominator.trim().parse::<f64>(),
                ) {
                    (Ok(n), Ok(d)) if d != 0.0 => Some(n / d * FRACTION_SCALE),
                    _ => None,
                }
            }
            None => text.trim().parse::<f64>().ok(),
        },
        _ => None,
    };

    converted.filter(|v| v.is_finite()).unwrap_or(0.0)
}

fn clamp_score(value: f64, scale_max: f64) -> f64 {
    value.clamp(0.0, scale_max)
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Normalize a parsed judge object into a complete scorecard. Never fails.
///
/// Missing or unparseable dimensions score 0.0. A missing `overall` is the mean of the
/// converted, clamped dimensions. For 1-5 rubrics a correctness or relevance of 1 forces
/// overall to 1.
pub fn coerce(parsed: &Map<String, Value>, rubric: Rubric) -> Scorecard {
    let scale_max = rubric.scale_max();

    let dimensions: BTreeMap<String, f64> = rubric
        .dimensions()
        .iter()
        .map(|name| {
            let score = clamp_score(to_float(parsed.get(*name)), scale_max);
            (name.to_string(), score)
        })
        .collect();

    let overall = match parsed.get("overall") {
        Some(value) if !value.is_null() => clamp_score(to_float(Some(value)), scale_max),
        _ => {
            let sum: f64 = dimensions.values().sum();
            sum / dimensions.len() as f64
        }
    };

    let mut dimensions: BTreeMap<String, f64> = dimensions
        .into_iter()
        .map(|(name, score)| (name, round1(score)))
        .collect();
    let mut overall = round1(overall);

    if rubric.forces_floor_overall() {
        let at_floor = |name: &str| dimensions.get(name).is_some_and(|score| *score == 1.0);
        if at_floor("correctness") || at_floor("relevance") {
            overall = 1.0;
        }
    }

    // Keep the map free of an `overall` key; it lives in its own field.
    dimensions.remove("overall");
    Scorecard {
        dimensions,
        overall,
    }
}
