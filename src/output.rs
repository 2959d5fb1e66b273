use crate::judge::JudgeVerdict;
use crate::metrics::MetricReport;
use crate::models::GenerationResult;
use crate::runner::{JudgeOutput, RejudgeReport};
use crate::statistics::Statistics;
use crate::store::ItemStatus;
use crate::verdict::ClaimVerdict;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Output format options
#[derive(Debug, Clone, Copy, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    Plain,
    Json,
}

/// Anything the CLI can print in both formats
pub trait Report: Serialize {
    fn render_plain(&self) -> String;
}

/// Print a report in the specified format
pub fn print_report<R: Report>(report: &R, format: OutputFormat) {
    match format {
        OutputFormat::Plain => print!("{}", report.render_plain()),
        OutputFormat::Json => print_json(report),
    }
}

fn print_json<R: Serialize>(report: &R) {
    match serde_json::to_string_pretty(report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Error serializing results to JSON: {}", e),
    }
}

/// Join rendered lines, each newline-terminated
fn join_lines(lines: Vec<String>) -> String {
    lines.into_iter().map(|line| line + "\n").collect()
}

impl Report for GenerationResult {
    fn render_plain(&self) -> String {
        let mut lines = vec![
            self.text.clone(),
            String::new(),
            format!("latency: {} ms", self.latency_ms),
        ];
        if let Some(reason) = &self.finish_reason {
            lines.push(format!("finish reason: {reason}"));
        }
        if let Some(usage) = &self.usage {
            let count = |value: Option<u32>| value.map_or("-".to_string(), |v| v.to_string());
            lines.push(format!(
                "tokens: prompt {}, completion {}, total {}",
                count(usage.prompt_tokens),
                count(usage.completion_tokens),
                count(usage.total_tokens)
            ));
        }
        join_lines(lines)
    }
}

fn verdict_lines(verdict: &JudgeVerdict) -> Vec<String> {
    match verdict {
        JudgeVerdict::Scored {
            scorecard,
            latency_ms,
            ..
        } => {
            let mut lines = vec![format!("{:<16} {:>6}", "Dimension", "Score"), "-".repeat(23)];
            lines.extend(
                scorecard
                    .entries()
                    .map(|(name, score)| format!("{:<16} {:>6.1}", name, score)),
            );
            lines.push(format!("judge latency: {latency_ms} ms"));
            lines
        }
        JudgeVerdict::Failed(failure) => {
            let code = failure.reason.as_deref().unwrap_or("backend_error");
            let mut lines = vec![format!("Judge failed: {code}")];
            if let Some(detail) = &failure.detail {
                lines.push(format!("detail: {detail}"));
            }
            if !failure.raw.is_empty() {
                lines.push(format!("raw: {}", failure.raw));
            }
            lines
        }
    }
}

impl Report for JudgeOutput {
    fn render_plain(&self) -> String {
        let mut lines = vec![
            format!("Judge: {} ({:?} rubric)", self.judge_model, self.rubric),
            String::new(),
        ];
        lines.extend(verdict_lines(&self.verdict));

        if let Some(distributions) = &self.distributions {
            lines.push(String::new());
            lines.push("Score distributions".to_string());
            for distribution in distributions {
                let tokens: Vec<String> = distribution
                    .top_tokens
                    .iter()
                    .map(|t| format!("{}={:.3}", t.token, t.prob))
                    .collect();
                lines.push(format!("  {:<16} {}", distribution.dimension, tokens.join(" ")));
            }
        }
        join_lines(lines)
    }
}

impl Report for MetricReport {
    fn render_plain(&self) -> String {
        let values = self
            .values
            .iter()
            .map(|(name, value)| format!("{:<8} {:.4}", name, value));
        let errors = self
            .errors
            .iter()
            .map(|(name, error)| format!("{:<8} failed: {}", name, error));
        join_lines(values.chain(errors).collect())
    }
}

impl Report for ClaimVerdict {
    fn render_plain(&self) -> String {
        let label = self
            .label
            .map_or("UNRECOGNIZED".to_string(), |label| label.to_string());
        format!("Label: {label}\nRaw: {}\n", self.raw_text)
    }
}

/// Statistics table
fn statistics_lines(stats: &Statistics) -> Vec<String> {
    if stats.count == 0 {
        return vec!["No statistics available.".to_string()];
    }

    let mut lines = vec![
        format!("{:<16} {:<8} {:<8} {:<8}", "Dimension", "Mean", "Median", "Mode"),
        "-".repeat(43),
    ];
    for (name, mean) in &stats.mean {
        let median = stats.median.get(name).copied().unwrap_or(0.0);
        let mode = stats.mode.get(name).copied().unwrap_or(0.0);
        lines.push(format!("{:<16} {:<8.3} {:<8.3} {:<8.3}", name, mean, median, mode));
    }
    lines
}

impl Report for RejudgeReport {
    fn render_plain(&self) -> String {
        let mut lines = vec![
            format!(
                "=== Rejudge: {} / {:?} / {} ===",
                self.judge_model, self.rubric, self.prompt_version
            ),
            String::new(),
        ];

        for outcome in &self.results {
            lines.push(match (outcome.status, &outcome.scorecard) {
                (ItemStatus::Ok, Some(scorecard)) => format!(
                    "#{:<6} ok     overall {:.1}",
                    outcome.generation_id, scorecard.overall
                ),
                _ => format!(
                    "#{:<6} error  {}",
                    outcome.generation_id,
                    outcome.error.as_deref().unwrap_or("unknown")
                ),
            });
        }

        lines.push(String::new());
        lines.push(format!(
            "STATISTICS ({} of {} items scored)",
            self.statistics.count,
            self.results.len()
        ));
        lines.extend(statistics_lines(&self.statistics));
        join_lines(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judge::{JudgeErrorKind, JudgeFailure};
    use crate::prompts::Rubric;
    use crate::runner::ItemOutcome;
    use crate::scoring::Scorecard;
    use std::collections::BTreeMap;

    fn scorecard() -> Scorecard {
        Scorecard {
            dimensions: BTreeMap::from([
                ("correctness".to_string(), 4.0),
                ("fluency".to_string(), 3.5),
                ("relevance".to_string(), 5.0),
            ]),
            overall: 4.2,
        }
    }

    fn rejudge_report() -> RejudgeReport {
        RejudgeReport {
            judge_model: "mistral:7b".into(),
            rubric: Rubric::Guided,
            prompt_version: "v2".into(),
            results: vec![
                ItemOutcome {
                    generation_id: 1,
                    status: ItemStatus::Ok,
                    scorecard: Some(scorecard()),
                    error: None,
                },
                ItemOutcome {
                    generation_id: 2,
                    status: ItemStatus::Error,
                    scorecard: None,
                    error: Some("backend_error".into()),
                },
            ],
            statistics: Statistics {
                mean: BTreeMap::from([("overall".to_string(), 4.2)]),
                median: BTreeMap::from([("overall".to_string(), 4.2)]),
                mode: BTreeMap::from([("overall".to_string(), 4.2)]),
                count: 1,
            },
        }
    }

    #[test]
    fn test_plain_judge_output() {
        let output = JudgeOutput {
            judge_model: "mistral:7b".into(),
            rubric: Rubric::Guided,
            verdict: JudgeVerdict::Scored {
                scorecard: scorecard(),
                raw_text: "{}".into(),
                latency_ms: 40,
            },
            distributions: None,
        };
        let text = output.render_plain();
        assert!(text.contains("correctness         4.0"));
        assert!(text.contains("overall             4.2"));
        assert!(text.contains("judge latency: 40 ms"));
    }

    #[test]
    fn test_plain_judge_failure() {
        let output = JudgeOutput {
            judge_model: "mistral:7b".into(),
            rubric: Rubric::Coarse,
            verdict: JudgeVerdict::Failed(JudgeFailure {
                error: JudgeErrorKind::ParseError,
                reason: Some("no_json_found".into()),
                detail: None,
                raw: "I think this is okay.".into(),
            }),
            distributions: None,
        };
        let text = output.render_plain();
        assert!(text.contains("Judge failed: no_json_found"));
        assert!(text.contains("raw: I think this is okay."));
    }

    #[test]
    fn test_plain_rejudge_report() {
        let text = rejudge_report().render_plain();
        assert!(text.contains("#1      ok     overall 4.2"));
        assert!(text.contains("#2      error  backend_error"));
        assert!(text.contains("STATISTICS (1 of 2 items scored)"));
        assert!(text.contains("overall          4.200"));
    }

    #[test]
    fn test_empty_statistics() {
        let text = join_lines(statistics_lines(&Statistics::default()));
        assert_eq!(text, "No statistics available.\n");
    }

    #[test]
    fn test_json_rejudge_report_shape() {
        let value = serde_json::to_value(rejudge_report()).unwrap();
        assert_eq!(value["results"][0]["status"], "ok");
        assert_eq!(value["results"][0]["scorecard"]["overall"], 4.2);
        assert_eq!(value["results"][1]["status"], "error");
        assert!(value["results"][1].get("scorecard").is_none());
    }

    #[test]
    fn test_plain_metric_report() {
        let report = MetricReport {
            values: BTreeMap::from([("bleu".to_string(), 42.123456)]),
            errors: BTreeMap::from([("cosine".to_string(), "embedding has zero norm".to_string())]),
        };
        let text = report.render_plain();
        assert!(text.contains("bleu     42.1235"));
        assert!(text.contains("cosine   failed: embedding has zero norm"));
    }

    #[test]
    fn test_plain_generation_result() {
        let result = GenerationResult {
            text: "Hello".into(),
            latency_ms: 12,
            finish_reason: Some("stop".into()),
            usage: Some(crate::models::Usage {
                prompt_tokens: Some(3),
                completion_tokens: None,
                total_tokens: Some(5),
            }),
        };
        assert_eq!(
            result.render_plain(),
            "Hello\n\nlatency: 12 ms\nfinish reason: stop\ntokens: prompt 3, completion -, total 5\n"
        );
    }

    #[test]
    fn test_print_report_both_formats() {
        let report = rejudge_report();
        print_report(&report, OutputFormat::Plain);
        print_report(&report, OutputFormat::Json);
    }
}
