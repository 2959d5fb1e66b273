use crate::scoring::Scorecard;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Per-dimension aggregates across a batch of scorecards
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Statistics {
    pub mean: BTreeMap<String, f64>,
    pub median: BTreeMap<String, f64>,
    pub mode: BTreeMap<String, f64>,
    /// Scorecards that contributed
    pub count: usize,
}

/// Calculate mean, median and mode for every dimension (and `overall`).
///
/// Only successful scorecards should be passed in; an empty batch yields zeros.
pub fn calculate_statistics(scorecards: &[&Scorecard], dimensions: &[&str]) -> Statistics {
    let mut stats = Statistics {
        count: scorecards.len(),
        ..Default::default()
    };

    let names = dimensions.iter().copied().chain(std::iter::once("overall"));
    for name in names {
        let scores: Vec<f64> = scorecards.iter().filter_map(|card| card.get(name)).collect();

        if scores.is_empty() {
            stats.mean.insert(name.to_string(), 0.0);
            stats.median.insert(name.to_string(), 0.0);
            stats.mode.insert(name.to_string(), 0.0);
            continue;
        }

        stats.mean.insert(name.to_string(), calculate_mean(&scores));
        stats.median.insert(name.to_string(), calculate_median(&scores));
        stats.mode.insert(name.to_string(), calculate_mode(&scores));
    }

    stats
}

fn calculate_mean(scores: &[f64]) -> f64 {
    let sum: f64 = scores.iter().sum();
    sum / scores.len() as f64
}

fn calculate_median(scores: &[f64]) -> f64 {
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// Most frequent value at one-decimal resolution; ties go to the smaller value
fn calculate_mode(scores: &[f64]) -> f64 {
    let mut frequency: HashMap<i64, usize> = HashMap::new();
    for &score in scores {
        *frequency.entry((score * 10.0).round() as i64).or_insert(0) += 1;
    }

    frequency
        .into_iter()
        .max_by(|(a_value, a_count), (b_value, b_count)| {
            a_count.cmp(b_count).then(b_value.cmp(a_value))
        })
        .map(|(tenths, _)| tenths as f64 / 10.0)
        .unwrap_or(0.0)
}
