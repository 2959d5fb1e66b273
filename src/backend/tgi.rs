use super::{BackendError, BackendSettings, Generate, post_json};
use crate::models::{GenerationParameters, GenerationResult, TokenLimits, Usage};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Self-hosted text-generation-inference server; the model identifier is its base URL
pub struct TgiBackend {
    http: reqwest::Client,
    limits: TokenLimits,
}

#[derive(Debug, Deserialize)]
struct TgiResponse {
    #[serde(default)]
    generated_text: Option<String>,
    #[serde(default)]
    outputs: Vec<TgiOutput>,
    #[serde(default)]
    details: Option<TgiDetails>,
}

#[derive(Debug, Deserialize)]
struct TgiOutput {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct TgiDetails {
    finish_reason: Option<String>,
    generated_tokens: Option<u32>,
}

impl TgiResponse {
    /// `generated_text` wins unless empty, then `outputs[0].text`
    fn text(&self) -> String {
        match self.generated_text.as_deref() {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => self
                .outputs
                .first()
                .map(|output| output.text.clone())
                .unwrap_or_default(),
        }
    }
}

impl TgiBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        Ok(Self {
            http: settings.http_client()?,
            limits: settings.limits,
        })
    }
}

impl Generate for TgiBackend {
    async fn generate(
        &self,
        base_url: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        let p = params.normalize(&self.limits);
        let url = format!("{}/generate", base_url.trim_end_matches('/'));
        let payload = json!({
            "inputs": prompt,
            "parameters": {
                "do_sample": true,
                "temperature": p.temperature,
                "top_p": p.top_p,
                "top_k": p.top_k,
                "max_new_tokens": p.max_new_tokens,
            }
        });

        let response = post_json::<TgiResponse>(&self.http, &url, None, &payload).await?;
        debug!(backend = "tgi", latency_ms = response.latency_ms, "generation finished");

        let text = response.body.text();
        let (finish_reason, usage) = match response.body.details {
            Some(details) => (
                details.finish_reason,
                details.generated_tokens.map(|tokens| Usage {
                    completion_tokens: Some(tokens),
                    ..Default::default()
                }),
            ),
            None => (None, None),
        };

        Ok(GenerationResult {
            text,
            latency_ms: response.latency_ms,
            finish_reason,
            usage,
        })
    }
}
