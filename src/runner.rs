use crate::backend::{Backend, BackendKind, FragmentStream, Generate};
use crate::context::EvalContext;
use crate::judge::{DimensionDistribution, JudgePipeline, JudgeVerdict, score_distributions};
use crate::metrics::{MetricKind, MetricReport, evaluate_metrics};
use crate::models::{GenerationParameters, GenerationResult, JudgeModel};
use crate::prompts::Rubric;
use crate::scoring::Scorecard;
use crate::statistics::{Statistics, calculate_statistics};
use crate::store::{GenerationStore, ItemStatus, JudgeRecord};
use crate::verdict::{ClaimVerdict, verify_claim};
use anyhow::{Context, Result, bail};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};

/// Per-id result of a rejudge batch
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub generation_id: u64,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scorecard: Option<Scorecard>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ItemOutcome {
    fn failed(generation_id: u64, error: String) -> Self {
        Self {
            generation_id,
            status: ItemStatus::Error,
            scorecard: None,
            error: Some(error),
        }
    }
}

/// Outcomes in input order plus aggregates over the successful ones
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RejudgeReport {
    pub judge_model: String,
    pub rubric: Rubric,
    pub prompt_version: String,
    pub results: Vec<ItemOutcome>,
    pub statistics: Statistics,
}

impl RejudgeReport {
    pub fn failures(&self) -> usize {
        self.results
            .iter()
            .filter(|outcome| outcome.status == ItemStatus::Error)
            .count()
    }
}

/// Single candidate scored by the judge, optionally with score-digit distributions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeOutput {
    pub judge_model: String,
    pub rubric: Rubric,
    pub verdict: JudgeVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributions: Option<Vec<DimensionDistribution>>,
}

/// Judge every id independently; one item's failure never stops the batch.
///
/// Up to `concurrency` items are in flight at once and results keep input order.
pub async fn rejudge<G, S>(
    pipeline: &JudgePipeline,
    generator: &G,
    store: &S,
    generation_ids: &[u64],
    reference: &str,
    prompt_version: &str,
    concurrency: usize,
) -> RejudgeReport
where
    G: Generate,
    S: GenerationStore,
{
    info!(
        items = generation_ids.len(),
        model = pipeline.model(),
        prompt_version,
        concurrency,
        "starting rejudge batch"
    );

    let results: Vec<ItemOutcome> = stream::iter(generation_ids.iter().copied())
        .map(|generation_id| {
            rejudge_one(pipeline, generator, store, generation_id, reference, prompt_version)
        })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let scorecards: Vec<&Scorecard> = results
        .iter()
        .filter(|outcome| outcome.status == ItemStatus::Ok)
        .filter_map(|outcome| outcome.scorecard.as_ref())
        .collect();
    let statistics = calculate_statistics(&scorecards, pipeline.rubric().dimensions());

    let report = RejudgeReport {
        judge_model: pipeline.model().to_string(),
        rubric: pipeline.rubric(),
        prompt_version: prompt_version.to_string(),
        results,
        statistics,
    };
    info!(
        items = report.results.len(),
        failures = report.failures(),
        "rejudge batch finished"
    );
    report
}

async fn rejudge_one<G, S>(
    pipeline: &JudgePipeline,
    generator: &G,
    store: &S,
    generation_id: u64,
    reference: &str,
    prompt_version: &str,
) -> ItemOutcome
where
    G: Generate,
    S: GenerationStore,
{
    let candidate = match store.candidate_text(generation_id).await {
        Ok(candidate) => candidate,
        Err(err) => {
            warn!(generation_id, error = %err, "could not load generation");
            return ItemOutcome::failed(generation_id, format!("not_found: {err:#}"));
        }
    };

    let verdict = pipeline.judge(generator, &candidate, reference).await;
    let scorecard = verdict.scorecard().cloned();
    let (status, error) = match &verdict {
        JudgeVerdict::Scored { .. } => (ItemStatus::Ok, None),
        JudgeVerdict::Failed(failure) => {
            let code = failure
                .reason
                .clone()
                .unwrap_or_else(|| "backend_error".to_string());
            (ItemStatus::Error, Some(code))
        }
    };

    let record = JudgeRecord {
        generation_id,
        reference: reference.to_string(),
        judge_model: pipeline.model().to_string(),
        rubric: pipeline.rubric(),
        prompt_version: prompt_version.to_string(),
        status,
        scorecard: scorecard.clone(),
        error: error.clone(),
        raw_text: verdict.raw_text().to_string(),
    };
    if let Err(err) = store.record_judgement(record).await {
        warn!(generation_id, error = %err, "could not persist judgement");
        return ItemOutcome::failed(generation_id, format!("persist_failed: {err:#}"));
    }

    info!(generation_id, status = ?status, "item judged");
    ItemOutcome {
        generation_id,
        status,
        scorecard,
        error,
    }
}

/// Dispatches CLI commands against the shared evaluation context
pub struct Runner {
    context: EvalContext,
}

impl Runner {
    pub fn new(context: EvalContext) -> Self {
        Self { context }
    }

    /// Configured judge, with optional command-line overrides
    pub fn judge_model(&self, backend: Option<BackendKind>, model: Option<&str>) -> JudgeModel {
        let config = &self.context.config().judge;
        JudgeModel {
            backend: backend.unwrap_or(config.backend),
            model: model.unwrap_or(&config.model).to_string(),
        }
    }

    fn judge_pipeline(&self, judge: &JudgeModel, rubric: Option<Rubric>) -> JudgePipeline {
        let mut judge_config = self.context.config().judge.clone();
        judge_config.model = judge.model.clone();
        if let Some(rubric) = rubric {
            judge_config.rubric = rubric;
        }
        JudgePipeline::from_config(&judge_config)
    }

    async fn backend(&self, kind: BackendKind) -> Result<&Backend> {
        self.context
            .backend(kind)
            .await
            .with_context(|| format!("Failed to create {kind} backend"))
    }

    pub async fn generate(
        &self,
        kind: BackendKind,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult> {
        let backend = self.backend(kind).await?;
        backend
            .generate(model, prompt, params)
            .await
            .with_context(|| format!("Generation failed on {} backend", backend.kind()))
    }

    pub async fn stream(
        &self,
        kind: BackendKind,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<FragmentStream> {
        let backend = self.backend(kind).await?;
        backend
            .stream_generate(model, prompt, params)
            .await
            .context("Failed to open generation stream")
    }

    pub async fn judge(
        &self,
        candidate: &str,
        reference: &str,
        judge: &JudgeModel,
        rubric: Option<Rubric>,
        with_distributions: bool,
    ) -> Result<JudgeOutput> {
        let pipeline = self.judge_pipeline(judge, rubric);
        let backend = self.backend(judge.backend).await?;
        let verdict = pipeline.judge(backend, candidate, reference).await;

        let distributions = if with_distributions {
            let Backend::Vllm(vllm) = backend else {
                bail!(
                    "score distributions need the vllm backend, judge is configured for {}",
                    backend.kind()
                );
            };
            let params = &self.context.config().judge.parameters;
            Some(
                score_distributions(vllm, pipeline.model(), reference, candidate, params)
                    .await
                    .context("Failed to fetch score distributions")?,
            )
        } else {
            None
        };

        Ok(JudgeOutput {
            judge_model: pipeline.model().to_string(),
            rubric: pipeline.rubric(),
            verdict,
            distributions,
        })
    }

    /// The embedder is only built when cosine is requested; its failure lands in `errors`
    pub async fn metrics(
        &self,
        requested: &[MetricKind],
        candidate: &str,
        reference: &str,
    ) -> MetricReport {
        evaluate_metrics(requested, candidate, reference, &self.context).await
    }

    pub async fn verify(&self, claim: &str, evidence: &str, judge: &JudgeModel) -> Result<ClaimVerdict> {
        let params = &self.context.config().judge.parameters;
        let backend = self.backend(judge.backend).await?;
        verify_claim(backend, &judge.model, claim, evidence, params)
            .await
            .context("Claim verification failed")
    }

    pub async fn rejudge<S: GenerationStore>(
        &self,
        store: &S,
        generation_ids: &[u64],
        reference: &str,
        judge: &JudgeModel,
        prompt_version: Option<&str>,
    ) -> Result<RejudgeReport> {
        if reference.trim().is_empty() {
            bail!("A reference text is required for rejudging");
        }
        let config = &self.context.config().judge;
        let pipeline = self.judge_pipeline(judge, None);
        let backend = self.backend(judge.backend).await?;
        let prompt_version = prompt_version.unwrap_or(&config.prompt_version);

        Ok(rejudge(
            &pipeline,
            backend,
            store,
            generation_ids,
            reference,
            prompt_version,
            config.concurrency,
        )
        .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendError;
    use crate::config::Config;
    use crate::judge::RetryPolicy;
    use crate::store::{Generation, JsonFileStore};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    /// Replies per candidate text; a candidate mapped to `None` times out
    struct CandidateGenerator {
        replies: HashMap<&'static str, Option<&'static str>>,
        delays: HashMap<&'static str, u64>,
    }

    impl Generate for CandidateGenerator {
        async fn generate(
            &self,
            _model: &str,
            prompt: &str,
            _params: &GenerationParameters,
        ) -> Result<GenerationResult, BackendError> {
            let (candidate, reply) = self
                .replies
                .iter()
                .find(|(candidate, _)| prompt.contains(&format!("CANDIDATE:\n{candidate}\n")))
                .map(|(candidate, reply)| (*candidate, *reply))
                .ok_or_else(|| BackendError::Transport("unexpected prompt".into()))?;

            if let Some(delay) = self.delays.get(candidate) {
                tokio::time::sleep(Duration::from_millis(*delay)).await;
            }
            match reply {
                Some(text) => Ok(GenerationResult {
                    text: text.to_string(),
                    latency_ms: 5,
                    finish_reason: None,
                    usage: None,
                }),
                None => Err(BackendError::Timeout("operation timed out".into())),
            }
        }
    }

    /// In-memory store
    #[derive(Default)]
    struct MemoryStore {
        generations: HashMap<u64, String>,
        records: Mutex<Vec<JudgeRecord>>,
        fail_writes: bool,
    }

    impl GenerationStore for MemoryStore {
        async fn candidate_text(&self, generation_id: u64) -> Result<String> {
            self.generations
                .get(&generation_id)
                .cloned()
                .with_context(|| format!("Generation {generation_id} not found"))
        }

        async fn record_judgement(&self, record: JudgeRecord) -> Result<()> {
            if self.fail_writes {
                bail!("disk full");
            }
            self.records.lock().unwrap().push(record);
            Ok(())
        }
    }

    fn store_with(generations: &[(u64, &str)]) -> MemoryStore {
        MemoryStore {
            generations: generations
                .iter()
                .map(|(id, text)| (*id, text.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    fn pipeline() -> JudgePipeline {
        JudgePipeline::new("mistral:7b", Rubric::Guided).with_retry(RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        })
    }

    const GOOD: &str = r#"{"correctness": 4, "relevance": 5, "fluency": 3}"#;

    #[tokio::test]
    async fn test_timeout_in_middle_item_is_isolated() {
        let generator = CandidateGenerator {
            replies: HashMap::from([("one", Some(GOOD)), ("two", None), ("three", Some(GOOD))]),
            delays: HashMap::new(),
        };
        let store = store_with(&[(1, "one"), (2, "two"), (3, "three")]);

        let report = rejudge(&pipeline(), &generator, &store, &[1, 2, 3], "ref", "v2", 1).await;

        let summary: Vec<(u64, ItemStatus)> = report
            .results
            .iter()
            .map(|outcome| (outcome.generation_id, outcome.status))
            .collect();
        assert_eq!(
            summary,
            vec![(1, ItemStatus::Ok), (2, ItemStatus::Error), (3, ItemStatus::Ok)]
        );
        assert_eq!(report.results[1].error.as_deref(), Some("backend_error"));
        assert_eq!(report.failures(), 1);

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 3);
        assert!(records.iter().all(|record| record.prompt_version == "v2"));
        assert_eq!(records[1].status, ItemStatus::Error);
        assert!(records[1].scorecard.is_none());
    }

    #[tokio::test]
    async fn test_parallel_batch_keeps_input_order() {
        let generator = CandidateGenerator {
            replies: HashMap::from([("slow", Some(GOOD)), ("fast", Some(GOOD)), ("mid", Some(GOOD))]),
            delays: HashMap::from([("slow", 60), ("mid", 20)]),
        };
        let store = store_with(&[(10, "slow"), (20, "fast"), (30, "mid")]);

        let report = rejudge(&pipeline(), &generator, &store, &[10, 20, 30], "ref", "v3", 3).await;

        let ids: Vec<u64> = report.results.iter().map(|o| o.generation_id).collect();
        assert_eq!(ids, vec![10, 20, 30]);
        assert!(report.results.iter().all(|o| o.status == ItemStatus::Ok));
    }

    #[tokio::test]
    async fn test_missing_generation_is_an_item_error() {
        let generator = CandidateGenerator {
            replies: HashMap::from([("one", Some(GOOD))]),
            delays: HashMap::new(),
        };
        let store = store_with(&[(1, "one")]);

        let report = rejudge(&pipeline(), &generator, &store, &[99, 1], "ref", "v2", 1).await;

        assert_eq!(report.results[0].status, ItemStatus::Error);
        assert!(report.results[0].error.as_ref().unwrap().contains("Generation 99 not found"));
        assert_eq!(report.results[1].status, ItemStatus::Ok);
    }

    #[tokio::test]
    async fn test_parse_failure_is_recorded_with_raw_text() {
        let generator = CandidateGenerator {
            replies: HashMap::from([("one", Some("Looks fine to me."))]),
            delays: HashMap::new(),
        };
        let store = store_with(&[(1, "one")]);

        let report = rejudge(&pipeline(), &generator, &store, &[1], "ref", "v2", 1).await;

        assert_eq!(report.results[0].error.as_deref(), Some("no_json_found"));
        let records = store.records.lock().unwrap();
        assert_eq!(records[0].raw_text, "Looks fine to me.");
    }

    #[tokio::test]
    async fn test_persist_failure_marks_item_error() {
        let generator = CandidateGenerator {
            replies: HashMap::from([("one", Some(GOOD))]),
            delays: HashMap::new(),
        };
        let mut store = store_with(&[(1, "one")]);
        store.fail_writes = true;

        let report = rejudge(&pipeline(), &generator, &store, &[1], "ref", "v2", 1).await;

        assert_eq!(report.results[0].status, ItemStatus::Error);
        assert!(report.results[0].error.as_ref().unwrap().starts_with("persist_failed"));
    }

    #[tokio::test]
    async fn test_statistics_use_only_successful_items() {
        let generator = CandidateGenerator {
            replies: HashMap::from([
                ("one", Some(r#"{"correctness": 4, "relevance": 4, "fluency": 4, "overall": 4}"#)),
                ("two", Some("no scores")),
                ("three", Some(r#"{"correctness": 2, "relevance": 2, "fluency": 2, "overall": 2}"#)),
            ]),
            delays: HashMap::new(),
        };
        let store = store_with(&[(1, "one"), (2, "two"), (3, "three")]);

        let report = rejudge(&pipeline(), &generator, &store, &[1, 2, 3], "ref", "v2", 2).await;

        assert_eq!(report.statistics.count, 2);
        assert_eq!(report.statistics.mean["overall"], 3.0);
        assert_eq!(report.statistics.mean["correctness"], 3.0);
    }

    #[tokio::test]
    async fn test_runner_rejudge_requires_reference() {
        let temp_dir = tempdir().unwrap();
        let store = JsonFileStore::open(&temp_dir.path().join("store.json")).unwrap();
        let runner = Runner::new(EvalContext::new(Config::default()));

        let judge = runner.judge_model(None, None);
        let result = runner.rejudge(&store, &[1], "   ", &judge, None).await;
        assert!(result.unwrap_err().to_string().contains("reference"));
    }

    #[tokio::test]
    async fn test_runner_rejudge_against_ollama_and_file_store() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/generate")
            .with_body(
                serde_json::json!({
                    "response": "```json\n{\"correctness\":3,\"relevance\":2,\"fluency\":4}\n```",
                    "done": true
                })
                .to_string(),
            )
            .create_async()
            .await;

        let mut config = Config::default();
        config.backends.ollama_base_url = server.url();
        let runner = Runner::new(EvalContext::new(config));

        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("store.json");
        let store = JsonFileStore::open(&path).unwrap();
        store
            .insert_generation(Generation {
                id: 5,
                output: "Paris.".into(),
                model: None,
            })
            .await
            .unwrap();

        let judge = runner.judge_model(None, None);
        let report = runner
            .rejudge(&store, &[5], "Paris is the capital of France.", &judge, Some("v9"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(report.prompt_version, "v9");
        assert_eq!(report.results[0].status, ItemStatus::Ok);
        assert_eq!(report.results[0].scorecard.as_ref().unwrap().overall, 3.0);

        let reopened = JsonFileStore::open(&path).unwrap();
        let judgements = reopened.judgements().await;
        assert_eq!(judgements.len(), 1);
        assert_eq!(judgements[0].judge_model, "mistral:7b");
    }

    #[tokio::test]
    async fn test_runner_distributions_need_vllm() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/generate")
            .with_body(r#"{"response": "{\"correctness\":3,\"relevance\":3,\"fluency\":3}", "done": true}"#)
            .create_async()
            .await;

        let mut config = Config::default();
        config.backends.ollama_base_url = server.url();
        let runner = Runner::new(EvalContext::new(config));

        let judge = runner.judge_model(Some(BackendKind::Ollama), Some("mistral:7b"));
        let result = runner.judge("cand", "ref", &judge, None, true).await;
        assert!(result.unwrap_err().to_string().contains("vllm"));
    }

    #[tokio::test]
    async fn test_runner_metrics_skip_embedder_without_cosine() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/embeddings")
            .expect(0)
            .create_async()
            .await;

        let mut config = Config::default();
        config.embedding.base_url = server.url();
        let runner = Runner::new(EvalContext::new(config));

        let report = runner
            .metrics(&[MetricKind::Bleu, MetricKind::Rouge], "the cat sat", "the cat sat")
            .await;

        mock.assert_async().await;
        assert!(report.values.contains_key("bleu"));
        assert!(report.values.contains_key("rougeL"));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_runner_metrics_embedding_failure_only_affects_cosine() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/embeddings")
            .with_status(503)
            .create_async()
            .await;

        let mut config = Config::default();
        config.embedding.base_url = server.url();
        let runner = Runner::new(EvalContext::new(config));

        let report = runner
            .metrics(
                &[MetricKind::Cosine, MetricKind::Bleu, MetricKind::Rouge],
                "the cat sat",
                "the cat sat",
            )
            .await;

        assert!(report.values.contains_key("bleu"));
        assert!(report.values.contains_key("rouge1"));
        assert!(!report.values.contains_key("cosine"));
        assert!(report.errors.contains_key("cosine"));
    }
}
