use crate::backend::BackendKind;
use serde::{Deserialize, Serialize};

/// Token accounting reported by a backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

/// Result of a single backend call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    /// The generated text
    pub text: String,
    /// Wall-clock time from request dispatch to full response receipt
    pub latency_ms: u64,
    /// Provider-reported stop reason, when the envelope carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Caller-supplied sampling options; anything left unset takes its default
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_k: Option<u32>,
    pub max_new_tokens: Option<u32>,
}

/// Process-wide bounds on generation length
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenLimits {
    pub default_max_new_tokens: u32,
    pub absolute_max_new_tokens: u32,
}

impl Default for TokenLimits {
    fn default() -> Self {
        Self {
            default_max_new_tokens: 256,
            absolute_max_new_tokens: 1024,
        }
    }
}

/// Parameters after defaults and clamps; the only shape backends build payloads from
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: u32,
    pub max_new_tokens: u32,
}

impl GenerationParameters {
    /// Apply defaults and clamp every option into its valid range.
    ///
    /// A `max_new_tokens` above the ceiling is reduced to the ceiling, never rejected.
    pub fn normalize(&self, limits: &TokenLimits) -> SamplingParams {
        let ceiling = limits.absolute_max_new_tokens.max(1);
        let requested = self
            .max_new_tokens
            .unwrap_or(limits.default_max_new_tokens);

        SamplingParams {
            temperature: finite_or(self.temperature, 0.7).clamp(0.0, 2.0),
            top_p: finite_or(self.top_p, 0.9).clamp(0.0, 1.0),
            top_k: self.top_k.unwrap_or(50),
            max_new_tokens: requested.clamp(1, ceiling),
        }
    }
}

fn finite_or(value: Option<f64>, default: f64) -> f64 {
    match value {
        Some(v) if v.is_finite() => v,
        _ => default,
    }
}

/// Which judge to ask and over which transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeModel {
    pub backend: BackendKind,
    pub model: String,
}

/// Truncate to at most `max_chars` characters on a char boundary
pub fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}

/// Cap applied to every raw payload carried in errors and records
pub const RAW_PREVIEW_CHARS: usize = 800;
