//! Judge pipeline: render, generate (with retry and rate limiting), extract, coerce.

use crate::backend::{BackendError, Generate, TokenProb, VllmBackend};
use crate::config::JudgeConfig;
use crate::extraction::{ExtractionFailure, ExtractionOutcome, FailureReason, extract};
use crate::models::{GenerationParameters, RAW_PREVIEW_CHARS, preview};
use crate::prompts::{Rubric, dimension_probe};
use crate::scoring::{Scorecard, coerce};
use serde::Serialize;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Bounded retry with exponential backoff for retryable backend errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first; values below 1 are treated as 1
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_millis(8_000),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &JudgeConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delay before retry number `retry` (1-based): `base * 2^(retry-1)`, capped at `max_delay`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, BackendError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    let backoff = self.backoff(attempt);
                    warn!(
                        error = %err,
                        attempt,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        "retrying judge call"
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Minimum spacing between judge requests
pub struct RateLimiter {
    min_interval: Option<Duration>,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// `rate_limit_rps <= 0` (or non-finite) disables limiting
    pub fn new(rate_limit_rps: f64) -> Self {
        let min_interval = (rate_limit_rps.is_finite() && rate_limit_rps > 0.0)
            .then(|| Duration::from_secs_f64(1.0 / rate_limit_rps));
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// Wait until the next request may be sent, then record it
    pub async fn acquire(&self) {
        let Some(min_interval) = self.min_interval else {
            return;
        };

        let mut last_request = self.last_request.lock().await;
        if let Some(last_time) = *last_request {
            let elapsed = last_time.elapsed();
            if elapsed < min_interval {
                sleep(min_interval - elapsed).await;
            }
        }
        *last_request = Some(Instant::now());
    }
}

/// Which stage of the pipeline produced a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JudgeErrorKind {
    BackendError,
    ParseError,
}

/// A judge call that did not yield a usable scorecard
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeFailure {
    pub error: JudgeErrorKind,
    /// Extraction reason code for parse errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// At most 800 characters of the offending text
    pub raw: String,
}

impl JudgeFailure {
    fn backend(err: &BackendError) -> Self {
        let raw = match err {
            BackendError::MalformedEnvelope { raw, .. } => raw.clone(),
            BackendError::Status { body, .. } => body.clone(),
            _ => String::new(),
        };
        Self {
            error: JudgeErrorKind::BackendError,
            reason: None,
            detail: Some(err.to_string()),
            raw,
        }
    }

    fn parse(failure: ExtractionFailure) -> Self {
        let detail = match &failure.reason {
            FailureReason::BadJson { detail } => Some(detail.clone()),
            FailureReason::MissingExpectedFields { missing } => Some(missing.join(", ")),
            FailureReason::NonStringResponse | FailureReason::NoJsonFound => None,
        };
        Self {
            error: JudgeErrorKind::ParseError,
            reason: Some(failure.reason.code().to_string()),
            detail,
            raw: failure.raw,
        }
    }
}

/// Outcome of judging one candidate
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JudgeVerdict {
    Scored {
        scorecard: Scorecard,
        /// Judge reply, capped at 800 characters
        raw_text: String,
        latency_ms: u64,
    },
    Failed(JudgeFailure),
}

impl JudgeVerdict {
    pub fn scorecard(&self) -> Option<&Scorecard> {
        match self {
            JudgeVerdict::Scored { scorecard, .. } => Some(scorecard),
            JudgeVerdict::Failed(_) => None,
        }
    }

    /// Judge text kept for auditing, whichever way the call went
    pub fn raw_text(&self) -> &str {
        match self {
            JudgeVerdict::Scored { raw_text, .. } => raw_text,
            JudgeVerdict::Failed(failure) => &failure.raw,
        }
    }
}

/// Everything needed to score candidates with one judge model and rubric
pub struct JudgePipeline {
    model: String,
    rubric: Rubric,
    params: GenerationParameters,
    retry: RetryPolicy,
    limiter: RateLimiter,
}

impl JudgePipeline {
    pub fn new(model: impl Into<String>, rubric: Rubric) -> Self {
        Self {
            model: model.into(),
            rubric,
            params: GenerationParameters::default(),
            retry: RetryPolicy::default(),
            limiter: RateLimiter::new(0.0),
        }
    }

    pub fn from_config(config: &JudgeConfig) -> Self {
        let mut pipeline = Self::new(config.model.clone(), config.rubric)
            .with_retry(RetryPolicy::from_config(config));
        pipeline.params = config.parameters.clone();
        pipeline.limiter = RateLimiter::new(config.rate_limit_rps);
        pipeline
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn rubric(&self) -> Rubric {
        self.rubric
    }

    /// Score `candidate` against `reference`. Never returns an error; failures are verdicts.
    pub async fn judge<G: Generate>(
        &self,
        generator: &G,
        candidate: &str,
        reference: &str,
    ) -> JudgeVerdict {
        let prompt = self.rubric.render(reference, candidate);
        let model = self.model.as_str();

        let generation = self
            .retry
            .run(|attempt| {
                let prompt = prompt.as_str();
                async move {
                    self.limiter.acquire().await;
                    debug!(model, attempt, "sending judge prompt");
                    generator.generate(model, prompt, &self.params).await
                }
            })
            .await;

        let generation = match generation {
            Ok(generation) => generation,
            Err(err) => {
                warn!(model, error = %err, "judge call failed");
                return JudgeVerdict::Failed(JudgeFailure::backend(&err));
            }
        };

        match extract(&generation.text, self.rubric.expected_keys()) {
            ExtractionOutcome::Parsed(object) => {
                let scorecard = coerce(&object, self.rubric);
                info!(
                    model,
                    overall = scorecard.overall,
                    latency_ms = generation.latency_ms,
                    "judge scored candidate"
                );
                JudgeVerdict::Scored {
                    scorecard,
                    raw_text: preview(&generation.text, RAW_PREVIEW_CHARS),
                    latency_ms: generation.latency_ms,
                }
            }
            ExtractionOutcome::Failed(failure) => {
                warn!(model, reason = failure.reason.code(), raw = %failure.raw, "judge reply unusable");
                JudgeVerdict::Failed(JudgeFailure::parse(failure))
            }
        }
    }
}

/// Normalized probability mass over the score digits for one dimension
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DimensionDistribution {
    pub dimension: String,
    pub top_tokens: Vec<TokenProb>,
}

const SCORE_TOKENS: [&str; 5] = ["1", "2", "3", "4", "5"];

/// Keep tokens that are score digits and rescale their probabilities to sum to 1
pub fn normalize_score_tokens(tokens: &[TokenProb]) -> Vec<TokenProb> {
    let digits: Vec<(&str, f64)> = tokens
        .iter()
        .map(|t| (t.token.trim(), t.prob))
        .filter(|(token, _)| SCORE_TOKENS.contains(token))
        .collect();

    let total: f64 = digits.iter().map(|(_, prob)| prob).sum();
    let total = if total > 0.0 { total } else { 1.0 };

    digits
        .into_iter()
        .map(|(token, prob)| TokenProb {
            token: token.to_string(),
            prob: (prob / total * 1000.0).round() / 1000.0,
        })
        .collect()
}

/// Probe each six-dimension rubric dimension for its score-digit distribution
pub async fn score_distributions(
    backend: &VllmBackend,
    model: &str,
    reference: &str,
    candidate: &str,
    params: &GenerationParameters,
) -> Result<Vec<DimensionDistribution>, BackendError> {
    let mut distributions = Vec::new();
    for dimension in Rubric::SixDimension.dimensions() {
        let probe = dimension_probe(dimension, reference, candidate);
        let tokens = backend.top_logprobs(model, &probe, params).await?;
        distributions.push(DimensionDistribution {
            dimension: dimension.to_string(),
            top_tokens: normalize_score_tokens(&tokens),
        });
    }
    Ok(distributions)
}
