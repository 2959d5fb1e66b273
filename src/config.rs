use crate::backend::BackendKind;
use crate::models::{GenerationParameters, TokenLimits};
use crate::prompts::Rubric;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Limits applied to every backend call
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// max_new_tokens used when a caller does not supply one
    #[serde(default = "default_max_new_tokens")]
    pub default_max_new_tokens: u32,
    /// Hard ceiling; larger requests are silently reduced
    #[serde(default = "absolute_max_new_tokens")]
    pub absolute_max_new_tokens: u32,
    /// Timeout for synchronous generate calls
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Timeout for streaming calls
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,
}

/// Endpoints and credentials for the inference transports
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendsConfig {
    /// Environment variable holding the Hugging Face token
    #[serde(default = "default_hf_token_env")]
    pub hf_token_env: String,
    /// OpenAI-compatible router base URL
    #[serde(default = "default_hf_router_base_url")]
    pub hf_router_base_url: String,
    /// Local generation daemon base URL
    #[serde(default = "default_ollama_base_url")]
    pub ollama_base_url: String,
    /// Self-hosted completions server base URL
    #[serde(default = "default_vllm_base_url")]
    pub vllm_base_url: String,
    /// Environment variable holding the completions server key
    #[serde(default = "default_vllm_api_key_env")]
    pub vllm_api_key_env: String,
}

/// Judge pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JudgeConfig {
    /// Transport used for judge calls
    #[serde(default = "default_judge_backend")]
    pub backend: BackendKind,
    /// Judge model identifier
    #[serde(default = "default_judge_model")]
    pub model: String,
    /// Rubric variant rendered into the judge prompt
    #[serde(default = "default_rubric")]
    pub rubric: Rubric,
    /// Tag stored alongside rejudged rows
    #[serde(default = "default_prompt_version")]
    pub prompt_version: String,
    /// Total attempts per judge call, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    /// Rate limit for judge requests per second (0 disables)
    #[serde(default)]
    pub rate_limit_rps: f64,
    /// Judge calls in flight during a rejudge batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Sampling parameters sent with every judge prompt
    #[serde(default = "default_judge_parameters")]
    pub parameters: GenerationParameters,
}

/// Sentence-embedding model used for cosine similarity
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
}

fn default_max_new_tokens() -> u32 {
    256
}

fn absolute_max_new_tokens() -> u32 {
    1024
}

fn default_request_timeout() -> u64 {
    120
}

fn default_stream_timeout() -> u64 {
    600
}

fn default_hf_token_env() -> String {
    "HF_TOKEN".to_string()
}

fn default_hf_router_base_url() -> String {
    "https://router.huggingface.co/v1".to_string()
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_vllm_base_url() -> String {
    "http://localhost:8000/v1".to_string()
}

fn default_vllm_api_key_env() -> String {
    "VLLM_API_KEY".to_string()
}

fn default_judge_backend() -> BackendKind {
    BackendKind::Ollama
}

fn default_judge_model() -> String {
    "mistral:7b".to_string()
}

fn default_rubric() -> Rubric {
    Rubric::Guided
}

fn default_prompt_version() -> String {
    "v2".to_string()
}

fn default_max_attempts() -> u32 {
    2
}

fn default_retry_base_delay() -> u64 {
    500
}

fn default_retry_max_delay() -> u64 {
    8_000
}

fn default_concurrency() -> usize {
    1
}

// Low temperature keeps judge output stable across runs.
fn default_judge_parameters() -> GenerationParameters {
    GenerationParameters {
        temperature: Some(0.0),
        top_p: Some(0.9),
        top_k: Some(50),
        max_new_tokens: Some(128),
    }
}

fn default_embedding_model() -> String {
    "all-minilm".to_string()
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            default_max_new_tokens: default_max_new_tokens(),
            absolute_max_new_tokens: absolute_max_new_tokens(),
            request_timeout_secs: default_request_timeout(),
            stream_timeout_secs: default_stream_timeout(),
        }
    }
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            hf_token_env: default_hf_token_env(),
            hf_router_base_url: default_hf_router_base_url(),
            ollama_base_url: default_ollama_base_url(),
            vllm_base_url: default_vllm_base_url(),
            vllm_api_key_env: default_vllm_api_key_env(),
        }
    }
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            backend: default_judge_backend(),
            model: default_judge_model(),
            rubric: default_rubric(),
            prompt_version: default_prompt_version(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            rate_limit_rps: 0.0,
            concurrency: default_concurrency(),
            parameters: default_judge_parameters(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_embedding_model(),
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub backends: BackendsConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config: {}", path.display()))
    }

    /// Load from `path` when given, otherwise fall back to built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }
}

impl LimitsConfig {
    pub fn token_limits(&self) -> TokenLimits {
        TokenLimits {
            default_max_new_tokens: self.default_max_new_tokens,
            absolute_max_new_tokens: self.absolute_max_new_tokens,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}
