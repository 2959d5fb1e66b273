//! Claim verification: ask a model whether evidence supports a claim and normalize its label.

use crate::backend::{BackendError, Generate};
use crate::extraction::{ExtractionOutcome, extract};
use crate::models::{GenerationParameters, RAW_PREVIEW_CHARS, preview};
use serde::Serialize;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimLabel {
    Supported,
    Refuted,
    NotEnoughInfo,
}

impl fmt::Display for ClaimLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClaimLabel::Supported => "SUPPORTED",
            ClaimLabel::Refuted => "REFUTED",
            ClaimLabel::NotEnoughInfo => "NOT_ENOUGH_INFO",
        })
    }
}

// Checked in this order; the first list with a hit decides.
const NOT_ENOUGH_INFO_PHRASES: &[&str] = &[
    "not enough info",
    "not enough information",
    "not_enough_info",
    "insufficient",
    "cannot be determined",
    "can't be determined",
    "unverifiable",
    "unknown",
    "nei",
];
const REFUTE_PHRASES: &[&str] = &[
    "not supported",
    "unsupported",
    "refute",
    "contradict",
    "incorrect",
    "false",
];
const SUPPORT_PHRASES: &[&str] = &["support", "true", "correct", "entail"];

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .any(|word| word == needle)
}

/// Map free text to a label.
///
/// Precedence: not-enough-info, then refuting phrases, then supporting phrases. "not supported"
/// therefore reads as refuted even though it contains "support".
pub fn normalize_label(text: &str) -> Option<ClaimLabel> {
    let lowered = text.trim().to_lowercase();
    if lowered.is_empty() {
        return None;
    }

    let hit = |phrases: &[&str]| {
        phrases.iter().any(|phrase| {
            // short tokens must match a whole word
            if phrase.len() <= 4 {
                contains_word(&lowered, phrase)
            } else {
                lowered.contains(phrase)
            }
        })
    };

    if hit(NOT_ENOUGH_INFO_PHRASES) {
        Some(ClaimLabel::NotEnoughInfo)
    } else if hit(REFUTE_PHRASES) {
        Some(ClaimLabel::Refuted)
    } else if hit(SUPPORT_PHRASES) {
        Some(ClaimLabel::Supported)
    } else {
        None
    }
}

const CLAIM_TEMPLATE: &str = r#"You are a fact-checking assistant.
Decide whether the EVIDENCE supports the CLAIM.

Answer ONLY with a JSON object: {"label": "SUPPORTED" | "REFUTED" | "NOT_ENOUGH_INFO"}

CLAIM:
{candidate}

EVIDENCE:
{reference}
"#;

pub fn render_claim_prompt(claim: &str, evidence: &str) -> String {
    crate::prompts::render(CLAIM_TEMPLATE, evidence, claim)
}

/// Label assigned to one claim, with the reply it was read from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaimVerdict {
    pub label: Option<ClaimLabel>,
    pub raw_text: String,
    pub latency_ms: u64,
}

/// Ask `generator` to label `claim` against `evidence`.
///
/// A `{"label": ...}` object in the reply wins; otherwise the whole reply is normalized.
pub async fn verify_claim<G: Generate>(
    generator: &G,
    model: &str,
    claim: &str,
    evidence: &str,
    params: &GenerationParameters,
) -> Result<ClaimVerdict, BackendError> {
    let prompt = render_claim_prompt(claim, evidence);
    let generation = generator.generate(model, &prompt, params).await?;

    let label = match extract(&generation.text, &["label"]) {
        ExtractionOutcome::Parsed(object) => object
            .get("label")
            .and_then(|value| value.as_str())
            .and_then(normalize_label)
            .or_else(|| normalize_label(&generation.text)),
        ExtractionOutcome::Failed(_) => normalize_label(&generation.text),
    };
    debug!(model, label = ?label, "claim labeled");

    Ok(ClaimVerdict {
        label,
        raw_text: preview(&generation.text, RAW_PREVIEW_CHARS),
        latency_ms: generation.latency_ms,
    })
}
