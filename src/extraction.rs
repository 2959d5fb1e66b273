//! Recovery of a JSON score object from free-form judge output.
//!
//! Judge models wrap their JSON in prose and code fences and occasionally break it with raw
//! newlines. Recovery is ordered and the first success wins:
//!
//! 1. non-string input fails as `non_string_response`
//! 2. surrounding whitespace and code fences are stripped
//! 3. the text between the first `{` and the last `}` is taken as the candidate block
//! 4. the block is parsed strictly
//! 5. on failure, whitespace runs are collapsed and the block is parsed once more
//! 6. the rubric's expected keys must all be present
//!
//! Every raw preview carried by a failure is capped at 800 characters.

use crate::models::{RAW_PREVIEW_CHARS, preview};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;

/// Why extraction failed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    NonStringResponse,
    NoJsonFound,
    BadJson { detail: String },
    MissingExpectedFields { missing: Vec<String> },
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::NonStringResponse => "non_string_response",
            FailureReason::NoJsonFound => "no_json_found",
            FailureReason::BadJson { .. } => "bad_json",
            FailureReason::MissingExpectedFields { .. } => "missing_expected_fields",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BadJson { detail } => write!(f, "bad_json: {detail}"),
            FailureReason::MissingExpectedFields { missing } => {
                write!(f, "missing_expected_fields: {}", missing.join(", "))
            }
            other => f.write_str(other.code()),
        }
    }
}

/// A failed extraction with a bounded preview of the text it was attempted on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionFailure {
    #[serde(flatten)]
    pub reason: FailureReason,
    pub raw: String,
}

/// Result of extraction; never an error
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Parsed(Map<String, Value>),
    Failed(ExtractionFailure),
}

impl ExtractionOutcome {
    fn failed(reason: FailureReason, raw: &str) -> Self {
        ExtractionOutcome::Failed(ExtractionFailure {
            reason,
            raw: preview(raw, RAW_PREVIEW_CHARS),
        })
    }
}

/// Extract from a provider value that may not even be a string
pub fn extract_value(value: &Value, expected_keys: &[&str]) -> ExtractionOutcome {
    match value {
        Value::String(text) => extract(text, expected_keys),
        other => ExtractionOutcome::failed(FailureReason::NonStringResponse, &other.to_string()),
    }
}

/// Extract the score object from judge text
pub fn extract(text: &str, expected_keys: &[&str]) -> ExtractionOutcome {
    let cleaned = strip_code_fences(text.trim());

    let block = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if end > start => &cleaned[start..=end],
        _ => return ExtractionOutcome::failed(FailureReason::NoJsonFound, cleaned),
    };

    let object = match parse_object(block) {
        Ok(object) => object,
        Err(first_error) => {
            let compact = block.split_whitespace().collect::<Vec<_>>().join(" ");
            match parse_object(&compact) {
                Ok(object) => object,
                Err(_) => {
                    return ExtractionOutcome::failed(
                        FailureReason::BadJson {
                            detail: first_error,
                        },
                        block,
                    );
                }
            }
        }
    };

    let missing: Vec<String> = expected_keys
        .iter()
        .filter(|key| !object.contains_key(**key))
        .map(|key| key.to_string())
        .collect();
    if !missing.is_empty() {
        return ExtractionOutcome::failed(FailureReason::MissingExpectedFields { missing }, cleaned);
    }

    ExtractionOutcome::Parsed(object)
}

fn parse_object(block: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(block) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(format!("expected a JSON object, found {other}")),
        Err(err) => Err(err.to_string()),
    }
}

/// Remove a leading ```` ``` ```` fence (with optional `json` tag) and a trailing fence
fn strip_code_fences(text: &str) -> &str {
    let mut text = text;
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.get(..4) {
            Some(tag) if tag.eq_ignore_ascii_case("json") => &rest[4..],
            _ => rest,
        };
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const THREE: &[&str] = &["correctness", "relevance", "fluency"];

    fn parsed(outcome: ExtractionOutcome) -> Map<String, Value> {
        match outcome {
            ExtractionOutcome::Parsed(object) => object,
            ExtractionOutcome::Failed(failure) => panic!("extraction failed: {failure:?}"),
        }
    }

    fn failed(outcome: ExtractionOutcome) -> ExtractionFailure {
        match outcome {
            ExtractionOutcome::Failed(failure) => failure,
            ExtractionOutcome::Parsed(object) => panic!("unexpected parse: {object:?}"),
        }
    }

    #[test]
    fn test_plain_json() {
        let object = parsed(extract(r#"{"correctness": 4, "relevance": 5, "fluency": 3}"#, THREE));
        assert_eq!(object["correctness"], json!(4));
    }

    #[test]
    fn test_json_embedded_in_prose_is_recovered_unchanged() {
        let inner = json!({"correctness": 7, "relevance": "8/10", "fluency": 6.5, "overall": 7});
        let text = format!("Sure! Here is my evaluation:\n{inner}\nLet me know if you need more.");
        let object = parsed(extract(&text, THREE));
        assert_eq!(Value::Object(object), inner);
    }

    #[test]
    fn test_code_fenced_json() {
        let text = "```json\n{\"correctness\":3,\"relevance\":2,\"fluency\":4}\n```";
        let object = parsed(extract(text, THREE));
        assert_eq!(object.len(), 3);
        assert!(!object.contains_key("overall"));
    }

    #[test]
    fn test_fence_without_language_tag() {
        let text = "```\n{\"correctness\":1,\"relevance\":1,\"fluency\":1}\n```\n";
        assert!(matches!(extract(text, THREE), ExtractionOutcome::Parsed(_)));
    }

    #[test]
    fn test_prose_without_braces() {
        let failure = failed(extract("I think this is okay.", THREE));
        assert_eq!(failure.reason, FailureReason::NoJsonFound);
        assert_eq!(failure.raw, "I think this is okay.");
    }

    #[test]
    fn test_no_json_preview_is_capped() {
        let text = "no braces here ".repeat(200);
        let failure = failed(extract(&text, THREE));
        assert_eq!(failure.reason.code(), "no_json_found");
        assert!(failure.raw.chars().count() <= 800);
    }

    #[test]
    fn test_closing_brace_before_opening_brace() {
        let failure = failed(extract("} nothing {", THREE));
        assert_eq!(failure.reason, FailureReason::NoJsonFound);
    }

    #[test]
    fn test_raw_newline_inside_string_recovered_by_whitespace_collapse() {
        let text = "{\"correctness\": 4, \"relevance\": 4, \"fluency\": 4, \"note\": \"good\nanswer\"}";
        let object = parsed(extract(text, THREE));
        assert_eq!(object["note"], json!("good answer"));
    }

    #[test]
    fn test_semantic_garbage_is_bad_json() {
        let failure = failed(extract("{correctness: four, relevance: high}", THREE));
        match &failure.reason {
            FailureReason::BadJson { detail } => assert!(!detail.is_empty()),
            other => panic!("unexpected reason: {other:?}"),
        }
        assert_eq!(failure.raw, "{correctness: four, relevance: high}");
    }

    #[test]
    fn test_bad_json_preview_is_capped() {
        let text = format!("{{\"correctness\": {}}}", "9 ".repeat(1000));
        let failure = failed(extract(&text, THREE));
        assert_eq!(failure.reason.code(), "bad_json");
        assert_eq!(failure.raw.chars().count(), 800);
    }

    #[test]
    fn test_missing_expected_fields() {
        let failure = failed(extract(r#"{"correctness": 4}"#, THREE));
        assert_eq!(
            failure.reason,
            FailureReason::MissingExpectedFields {
                missing: vec!["relevance".to_string(), "fluency".to_string()]
            }
        );
        assert_eq!(failure.raw, r#"{"correctness": 4}"#);
    }

    #[test]
    fn test_no_expected_keys_accepts_any_object() {
        assert!(matches!(extract("{}", &[]), ExtractionOutcome::Parsed(_)));
    }

    #[test]
    fn test_non_string_value() {
        let failure = failed(extract_value(&json!({"response": 1}), THREE));
        assert_eq!(failure.reason, FailureReason::NonStringResponse);
        assert_eq!(failure.raw, r#"{"response":1}"#);
    }

    #[test]
    fn test_string_value_is_extracted() {
        let value = json!("{\"correctness\":1,\"relevance\":2,\"fluency\":3}");
        assert!(matches!(extract_value(&value, THREE), ExtractionOutcome::Parsed(_)));
    }

    #[test]
    fn test_failure_serializes_with_reason_code() {
        let failure = failed(extract("nope", THREE));
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value, json!({"reason": "no_json_found", "raw": "nope"}));
    }
}
