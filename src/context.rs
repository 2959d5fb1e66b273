use crate::backend::{Backend, BackendError, BackendKind, BackendSettings};
use crate::config::Config;
use crate::metrics::{Embed, MetricError, OllamaEmbedder};
use tokio::sync::OnceCell;
use tracing::info;

/// Process-wide state: one lazily built client per backend kind and one embedder.
///
/// Cells initialize at most once even when first use races; afterwards they are read-only.
pub struct EvalContext {
    config: Config,
    settings: BackendSettings,
    hf_endpoint: OnceCell<Backend>,
    tgi: OnceCell<Backend>,
    hf_router: OnceCell<Backend>,
    ollama: OnceCell<Backend>,
    vllm: OnceCell<Backend>,
    embedder: OnceCell<OllamaEmbedder>,
}

impl EvalContext {
    pub fn new(config: Config) -> Self {
        let settings = BackendSettings::from_config(&config);
        Self {
            config,
            settings,
            hf_endpoint: OnceCell::new(),
            tgi: OnceCell::new(),
            hf_router: OnceCell::new(),
            ollama: OnceCell::new(),
            vllm: OnceCell::new(),
            embedder: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn cell(&self, kind: BackendKind) -> &OnceCell<Backend> {
        match kind {
            BackendKind::HfEndpoint => &self.hf_endpoint,
            BackendKind::Tgi => &self.tgi,
            BackendKind::HfRouter => &self.hf_router,
            BackendKind::Ollama => &self.ollama,
            BackendKind::Vllm => &self.vllm,
        }
    }

    /// Shared client for `kind`, created on first use
    pub async fn backend(&self, kind: BackendKind) -> Result<&Backend, BackendError> {
        self.cell(kind)
            .get_or_try_init(|| async {
                info!(backend = %kind, "initializing backend client");
                Backend::connect(kind, &self.settings)
            })
            .await
    }

    /// Shared sentence embedder, created on first use
    pub async fn embedder(&self) -> Result<&OllamaEmbedder, MetricError> {
        self.embedder
            .get_or_try_init(|| async {
                info!(model = %self.config.embedding.model, "initializing embedder");
                OllamaEmbedder::new(&self.config.embedding, self.settings.request_timeout)
            })
            .await
    }
}

/// Embeds through the shared embedder, building it on first use; a build failure is reported
/// as the embedding error
impl Embed for EvalContext {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MetricError> {
        self.embedder().await?.embed(text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_backend_is_created_once_and_reused() {
        let context = EvalContext::new(Config::default());
        let first = context.backend(BackendKind::Tgi).await.unwrap() as *const Backend;
        let second = context.backend(BackendKind::Tgi).await.unwrap() as *const Backend;
        assert_eq!(first, second);
        assert!(context.backend(BackendKind::Ollama).await.unwrap().kind() == BackendKind::Ollama);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_yields_one_client() {
        let context = Arc::new(EvalContext::new(Config::default()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let context = Arc::clone(&context);
                tokio::spawn(async move {
                    context.backend(BackendKind::Vllm).await.unwrap() as *const Backend as usize
                })
            })
            .collect();

        let mut addresses = Vec::new();
        for handle in handles {
            addresses.push(handle.await.unwrap());
        }
        addresses.dedup();
        assert_eq!(addresses.len(), 1);
    }

    #[tokio::test]
    async fn test_embedder_is_cached() {
        let context = EvalContext::new(Config::default());
        let first = context.embedder().await.unwrap() as *const OllamaEmbedder;
        let second = context.embedder().await.unwrap() as *const OllamaEmbedder;
        assert_eq!(first, second);
    }
}
