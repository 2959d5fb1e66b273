//! Uniform interface over the text-generation transports.
//!
//! Every transport normalizes [`GenerationParameters`] before building its payload and maps its
//! own response envelope onto [`GenerationResult`]. Nothing here retries; retry policy belongs
//! to the caller.

mod hf_endpoint;
mod hf_router;
mod ollama;
mod tgi;
mod vllm;

pub use hf_endpoint::HfEndpointBackend;
pub use hf_router::HfRouterBackend;
pub use ollama::OllamaBackend;
pub use tgi::TgiBackend;
pub use vllm::{TokenProb, VllmBackend};

use crate::config::Config;
use crate::models::{GenerationParameters, GenerationResult, RAW_PREVIEW_CHARS, TokenLimits, preview};
use clap::ValueEnum;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Lazy, finite, non-restartable sequence of generated text fragments
pub type FragmentStream = BoxStream<'static, Result<String, BackendError>>;

/// Transport kinds; adding one is a compile-checked change to every match below
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted inference endpoint
    HfEndpoint,
    /// Self-hosted text-generation-inference server
    Tgi,
    /// OpenAI-compatible chat router
    HfRouter,
    /// Local generation daemon with NDJSON streaming
    Ollama,
    /// Self-hosted OpenAI-completions server
    Vllm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HfEndpoint => "hf_endpoint",
            BackendKind::Tgi => "tgi",
            BackendKind::HfRouter => "hf_router",
            BackendKind::Ollama => "ollama",
            BackendKind::Vllm => "vllm",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport or provider failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response envelope: {detail}")]
    MalformedEnvelope { detail: String, raw: String },
    #[error("streaming is not supported by the {0} backend")]
    StreamingUnsupported(BackendKind),
    #[error("backend configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    /// Whether a caller may reasonably try the same request again
    pub fn is_retryable(&self) -> bool {
        match self {
            BackendError::Timeout(_) | BackendError::Transport(_) => true,
            BackendError::Status { status, .. } => *status == 429 || *status >= 500,
            BackendError::MalformedEnvelope { .. }
            | BackendError::StreamingUnsupported(_)
            | BackendError::Configuration(_) => false,
        }
    }

    pub(crate) fn malformed(detail: impl fmt::Display, raw: &str) -> Self {
        BackendError::MalformedEnvelope {
            detail: detail.to_string(),
            raw: preview(raw, RAW_PREVIEW_CHARS),
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            BackendError::Status {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            BackendError::Transport(err.to_string())
        }
    }
}

/// Anything that can turn a prompt into text
pub trait Generate {
    fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> impl Future<Output = Result<GenerationResult, BackendError>> + Send;
}

/// Settings every transport shares
#[derive(Debug, Clone)]
pub struct BackendSettings {
    pub limits: TokenLimits,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub hf_token: Option<String>,
    pub hf_router_base_url: String,
    pub ollama_base_url: String,
    pub vllm_base_url: String,
    pub vllm_api_key: Option<String>,
}

impl BackendSettings {
    /// Resolve settings from config, reading tokens from the named environment variables
    pub fn from_config(config: &Config) -> Self {
        Self {
            limits: config.limits.token_limits(),
            request_timeout: config.limits.request_timeout(),
            stream_timeout: config.limits.stream_timeout(),
            hf_token: read_secret(&config.backends.hf_token_env),
            hf_router_base_url: config.backends.hf_router_base_url.clone(),
            ollama_base_url: config.backends.ollama_base_url.clone(),
            vllm_base_url: config.backends.vllm_base_url.clone(),
            vllm_api_key: read_secret(&config.backends.vllm_api_key_env),
        }
    }

    pub(crate) fn http_client(&self) -> Result<reqwest::Client, BackendError> {
        reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|err| BackendError::Configuration(err.to_string()))
    }
}

fn read_secret(env_var: &str) -> Option<String> {
    std::env::var(env_var).ok().filter(|value| !value.is_empty())
}

/// One client per transport kind, dispatched by exhaustive match
pub enum Backend {
    HfEndpoint(HfEndpointBackend),
    Tgi(TgiBackend),
    HfRouter(HfRouterBackend),
    Ollama(OllamaBackend),
    Vllm(VllmBackend),
}

impl Backend {
    /// Build the client for `kind`
    pub fn connect(kind: BackendKind, settings: &BackendSettings) -> Result<Self, BackendError> {
        debug!(backend = %kind, "creating backend client");
        Ok(match kind {
            BackendKind::HfEndpoint => Backend::HfEndpoint(HfEndpointBackend::new(settings)?),
            BackendKind::Tgi => Backend::Tgi(TgiBackend::new(settings)?),
            BackendKind::HfRouter => Backend::HfRouter(HfRouterBackend::new(settings)?),
            BackendKind::Ollama => Backend::Ollama(OllamaBackend::new(settings)?),
            BackendKind::Vllm => Backend::Vllm(VllmBackend::new(settings)?),
        })
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::HfEndpoint(_) => BackendKind::HfEndpoint,
            Backend::Tgi(_) => BackendKind::Tgi,
            Backend::HfRouter(_) => BackendKind::HfRouter,
            Backend::Ollama(_) => BackendKind::Ollama,
            Backend::Vllm(_) => BackendKind::Vllm,
        }
    }

    /// Stream text fragments; only transports with an incremental wire format support this
    pub async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        match self {
            Backend::Ollama(backend) => backend.stream_generate(model, prompt, params).await,
            Backend::HfEndpoint(_) | Backend::Tgi(_) | Backend::HfRouter(_) | Backend::Vllm(_) => {
                Err(BackendError::StreamingUnsupported(self.kind()))
            }
        }
    }
}

impl Generate for Backend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        match self {
            Backend::HfEndpoint(backend) => backend.generate(model, prompt, params).await,
            Backend::Tgi(backend) => backend.generate(model, prompt, params).await,
            Backend::HfRouter(backend) => backend.generate(model, prompt, params).await,
            Backend::Ollama(backend) => backend.generate(model, prompt, params).await,
            Backend::Vllm(backend) => backend.generate(model, prompt, params).await,
        }
    }
}

/// Outcome of a JSON POST: decoded envelope plus the measured network latency
pub(crate) struct Timed<T> {
    pub body: T,
    pub latency_ms: u64,
}

/// POST `payload` and decode the envelope as `T`.
///
/// Latency covers dispatch through full body receipt; payload serialization happens before
/// the clock starts.
pub(crate) async fn post_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    payload: &serde_json::Value,
) -> Result<Timed<T>, BackendError> {
    let mut request = client.post(url).json(payload);
    if let Some(token) = bearer {
        request = request.bearer_auth(token);
    }

    let started = Instant::now();
    let response = request.send().await?;
    let status = response.status();
    let raw = response.text().await?;
    let latency_ms = started.elapsed().as_millis() as u64;

    if !status.is_success() {
        return Err(BackendError::Status {
            status: status.as_u16(),
            body: preview(&raw, RAW_PREVIEW_CHARS),
        });
    }

    let body = serde_json::from_str(&raw).map_err(|err| BackendError::malformed(err, &raw))?;
    Ok(Timed { body, latency_ms })
}
