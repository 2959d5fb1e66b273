use super::{BackendError, BackendSettings, Generate, post_json};
use crate::models::{GenerationParameters, GenerationResult, TokenLimits};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

/// Hosted inference endpoint; the model identifier is the endpoint URL
pub struct HfEndpointBackend {
    http: reqwest::Client,
    token: Option<String>,
    limits: TokenLimits,
}

/// Endpoints answer with either a batch or a single object
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EndpointResponse {
    Batch(Vec<GeneratedText>),
    Single(GeneratedText),
}

#[derive(Debug, Deserialize)]
struct GeneratedText {
    #[serde(default)]
    generated_text: String,
}

impl EndpointResponse {
    fn into_text(self) -> String {
        match self {
            EndpointResponse::Batch(items) => items
                .into_iter()
                .next()
                .map(|item| item.generated_text)
                .unwrap_or_default(),
            EndpointResponse::Single(item) => item.generated_text,
        }
    }
}

impl HfEndpointBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        Ok(Self {
            http: settings.http_client()?,
            token: settings.hf_token.clone(),
            limits: settings.limits,
        })
    }
}

impl Generate for HfEndpointBackend {
    async fn generate(
        &self,
        endpoint_url: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        let p = params.normalize(&self.limits);
        let payload = json!({
            "inputs": prompt,
            "parameters": {
                "temperature": p.temperature,
                "top_p": p.top_p,
                "top_k": p.top_k,
                "max_new_tokens": p.max_new_tokens,
                "return_full_text": false,
            }
        });

        let response =
            post_json::<EndpointResponse>(&self.http, endpoint_url, self.token.as_deref(), &payload)
                .await?;
        debug!(backend = "hf_endpoint", latency_ms = response.latency_ms, "generation finished");

        Ok(GenerationResult {
            text: response.body.into_text(),
            latency_ms: response.latency_ms,
            finish_reason: None,
            usage: None,
        })
    }
}
