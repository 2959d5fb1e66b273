use super::{BackendError, BackendSettings, Generate, post_json};
use crate::models::{GenerationParameters, GenerationResult, TokenLimits, Usage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use tracing::debug;

/// Candidates kept from a logprobs request
const TOP_LOGPROBS: usize = 10;

/// Self-hosted OpenAI-completions server (`/completions`)
pub struct VllmBackend {
    http: reqwest::Client,
    url: String,
    api_key: Option<String>,
    limits: TokenLimits,
}

/// A candidate next token and its probability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenProb {
    pub token: String,
    pub prob: f64,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<CompletionUsage>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<CompletionLogprobs>,
}

#[derive(Debug, Deserialize)]
struct CompletionLogprobs {
    #[serde(default)]
    top_logprobs: Vec<HashMap<String, f64>>,
}

#[derive(Debug, Deserialize)]
struct CompletionUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl VllmBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        Ok(Self {
            http: settings.http_client()?,
            url: format!("{}/completions", settings.vllm_base_url.trim_end_matches('/')),
            api_key: settings.vllm_api_key.clone(),
            limits: settings.limits,
        })
    }

    /// POST a completions payload and keep the first choice
    async fn complete(
        &self,
        payload: serde_json::Value,
    ) -> Result<(CompletionChoice, Option<CompletionUsage>, u64), BackendError> {
        let response =
            post_json::<CompletionResponse>(&self.http, &self.url, self.api_key.as_deref(), &payload)
                .await?;
        let latency_ms = response.latency_ms;
        let CompletionResponse { choices, usage } = response.body;
        let choice = choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::malformed("response has no choices", ""))?;
        Ok((choice, usage, latency_ms))
    }

    /// Most likely next tokens for `prompt`, highest probability first
    pub async fn top_logprobs(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<Vec<TokenProb>, BackendError> {
        let p = params.normalize(&self.limits);
        let payload = json!({
            "model": model,
            "prompt": prompt,
            "max_tokens": 1,
            "temperature": p.temperature,
            "top_p": p.top_p,
            "top_k": p.top_k,
            "logprobs": TOP_LOGPROBS,
            "echo": false,
        });

        let (choice, _, latency_ms) = self.complete(payload).await?;
        debug!(backend = "vllm", model, latency_ms, "logprobs received");

        let first = choice
            .logprobs
            .and_then(|logprobs| logprobs.top_logprobs.into_iter().next())
            .ok_or_else(|| BackendError::malformed("response carries no top_logprobs", ""))?;

        let mut tokens: Vec<TokenProb> = first
            .into_iter()
            .map(|(token, logprob)| TokenProb {
                token,
                prob: round_to(logprob.exp(), 5),
            })
            .collect();
        tokens.sort_by(|a, b| b.prob.partial_cmp(&a.prob).unwrap_or(std::cmp::Ordering::Equal));
        tokens.truncate(TOP_LOGPROBS);
        Ok(tokens)
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

impl Generate for VllmBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        let p = params.normalize(&self.limits);
        let payload = json!({
            "model": model,
            "prompt": prompt,
            "max_tokens": p.max_new_tokens,
            "temperature": p.temperature,
            "top_p": p.top_p,
            "top_k": p.top_k,
        });

        let (choice, usage, latency_ms) = self.complete(payload).await?;
        debug!(backend = "vllm", model, latency_ms, "generation finished");

        Ok(GenerationResult {
            text: choice.text.trim().to_string(),
            latency_ms,
            finish_reason: choice.finish_reason,
            usage: usage.map(|usage| Usage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        })
    }
}
