//! Classic reference-based metrics: BLEU, ROUGE and embedding cosine similarity.
//!
//! Each metric is callable on its own. [`evaluate_metrics`] runs a requested set and keeps every
//! failure next to the metric that produced it.

use crate::config::EmbeddingConfig;
use clap::ValueEnum;
use rust_stemmers::{Algorithm, Stemmer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

const BLEU_MAX_ORDER: usize = 4;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricError {
    #[error("embedding request failed: {0}")]
    Embedding(String),
    #[error("embedding model returned an empty vector")]
    EmptyEmbedding,
    #[error("embedding has zero norm")]
    ZeroNorm,
    #[error("embedding dimensions differ: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    Bleu,
    Rouge,
    Cosine,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Bleu => "bleu",
            MetricKind::Rouge => "rouge",
            MetricKind::Cosine => "cosine",
        }
    }
}

/// Tokenize the way the 13a reference tokenizer does: split off punctuation, keep decimal
/// points and thousands separators between digits.
fn tokenize_13a(text: &str) -> Vec<String> {
    let text = text.replace("<skipped>", "").replace("-\n", "").replace('\n', " ");
    let text = if text.contains('&') {
        text.replace("&quot;", "\"")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
    } else {
        text
    };

    let chars: Vec<char> = text.chars().collect();
    let mut spaced = String::with_capacity(text.len() * 2);
    for (i, &c) in chars.iter().enumerate() {
        let prev = i.checked_sub(1).and_then(|p| chars.get(p)).copied().unwrap_or(' ');
        let next = chars.get(i + 1).copied().unwrap_or(' ');
        let split = match c {
            '{' | '|' | '}' | '~' | '[' | '\\' | ']' | '^' | '_' | '`' | '!' | '"' | '#'
            | '$' | '%' | '&' | '(' | ')' | '*' | '+' | ':' | ';' | '<' | '=' | '>' | '?'
            | '@' | '/' => true,
            '.' | ',' => !(prev.is_ascii_digit() && next.is_ascii_digit()),
            '-' => prev.is_ascii_digit(),
            _ => false,
        };
        if split {
            spaced.push(' ');
            spaced.push(c);
            spaced.push(' ');
        } else {
            spaced.push(c);
        }
    }

    spaced.split_whitespace().map(str::to_string).collect()
}

fn ngram_counts(tokens: &[String], n: usize) -> HashMap<&[String], usize> {
    let mut counts = HashMap::new();
    if tokens.len() >= n {
        for window in tokens.windows(n) {
            *counts.entry(window).or_insert(0) += 1;
        }
    }
    counts
}

/// Corpus BLEU over a one-sentence corpus, on the 0-100 scale.
///
/// Orders 1-4 with exponential smoothing for orders that have no matches, and the standard
/// brevity penalty.
pub fn bleu(candidate: &str, reference: &str) -> f64 {
    let hyp = tokenize_13a(candidate);
    let refs = tokenize_13a(reference);
    if hyp.is_empty() {
        return 0.0;
    }

    let mut precisions = [0.0f64; BLEU_MAX_ORDER];
    let mut smooth = 1.0;
    for n in 1..=BLEU_MAX_ORDER {
        let total = hyp.len().saturating_sub(n - 1);
        if total == 0 {
            break;
        }
        let ref_counts = ngram_counts(&refs, n);
        let correct: usize = ngram_counts(&hyp, n)
            .iter()
            .map(|(gram, count)| (*count).min(ref_counts.get(gram).copied().unwrap_or(0)))
            .sum();

        precisions[n - 1] = if correct == 0 {
            smooth *= 2.0;
            100.0 / (smooth * total as f64)
        } else {
            100.0 * correct as f64 / total as f64
        };
    }

    if precisions.iter().any(|p| *p <= 0.0) {
        return 0.0;
    }

    let brevity_penalty = if hyp.len() < refs.len() {
        (1.0 - refs.len() as f64 / hyp.len() as f64).exp()
    } else {
        1.0
    };
    let log_mean = precisions.iter().map(|p| p.ln()).sum::<f64>() / BLEU_MAX_ORDER as f64;
    brevity_penalty * log_mean.exp()
}

/// Tokens of this length or shorter are left unstemmed
const ROUGE_STEM_MIN_LEN: usize = 3;

/// Lowercased alphanumeric tokens, Porter-stemmed when longer than three characters
fn rouge_tokens(text: &str) -> Vec<String> {
    let stemmer = Stemmer::create(Algorithm::English);
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| {
            if token.len() > ROUGE_STEM_MIN_LEN {
                stemmer.stem(token).into_owned()
            } else {
                token.to_string()
            }
        })
        .collect()
}

fn f_measure(hits: usize, candidate_len: usize, reference_len: usize) -> f64 {
    if hits == 0 || candidate_len == 0 || reference_len == 0 {
        return 0.0;
    }
    let precision = hits as f64 / candidate_len as f64;
    let recall = hits as f64 / reference_len as f64;
    2.0 * precision * recall / (precision + recall)
}

fn token_counts(tokens: &[String]) -> HashMap<&str, usize> {
    let mut counts = HashMap::new();
    for token in tokens {
        *counts.entry(token.as_str()).or_insert(0) += 1;
    }
    counts
}

/// Unigram overlap F1
pub fn rouge1(candidate: &str, reference: &str) -> f64 {
    let cand = rouge_tokens(candidate);
    let refs = rouge_tokens(reference);
    let ref_counts = token_counts(&refs);
    let hits: usize = token_counts(&cand)
        .iter()
        .map(|(token, count)| (*count).min(ref_counts.get(token).copied().unwrap_or(0)))
        .sum();
    f_measure(hits, cand.len(), refs.len())
}

/// Indices into `reference` of one longest common subsequence with `candidate`
fn lcs_indices(reference: &[String], candidate: &[String]) -> Vec<usize> {
    let rows = reference.len();
    let cols = candidate.len();
    let mut table = vec![vec![0usize; cols + 1]; rows + 1];
    for i in 1..=rows {
        for j in 1..=cols {
            table[i][j] = if reference[i - 1] == candidate[j - 1] {
                table[i - 1][j - 1] + 1
            } else {
                table[i - 1][j].max(table[i][j - 1])
            };
        }
    }

    let mut indices = Vec::new();
    let (mut i, mut j) = (rows, cols);
    while i > 0 && j > 0 {
        if reference[i - 1] == candidate[j - 1] {
            indices.push(i - 1);
            i -= 1;
            j -= 1;
        } else if table[i][j - 1] > table[i - 1][j] {
            j -= 1;
        } else {
            i -= 1;
        }
    }
    indices.reverse();
    indices
}

fn sentences(text: &str) -> Vec<Vec<String>> {
    text.split('\n')
        .map(rouge_tokens)
        .filter(|tokens| !tokens.is_empty())
        .collect()
}

/// Summary-level LCS F1 over newline-separated sentences (union LCS per reference sentence)
pub fn rouge_lsum(candidate: &str, reference: &str) -> f64 {
    let cand_sents = sentences(candidate);
    let ref_sents = sentences(reference);
    let cand_len: usize = cand_sents.iter().map(Vec::len).sum();
    let ref_len: usize = ref_sents.iter().map(Vec::len).sum();
    if cand_len == 0 || ref_len == 0 {
        return 0.0;
    }

    let mut cand_counts: HashMap<&str, usize> = HashMap::new();
    for token in cand_sents.iter().flatten() {
        *cand_counts.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut ref_counts: HashMap<&str, usize> = HashMap::new();
    for token in ref_sents.iter().flatten() {
        *ref_counts.entry(token.as_str()).or_insert(0) += 1;
    }

    let mut hits = 0;
    for ref_sent in &ref_sents {
        let mut union: Vec<usize> = cand_sents
            .iter()
            .flat_map(|cand_sent| lcs_indices(ref_sent, cand_sent))
            .collect();
        union.sort_unstable();
        union.dedup();

        for index in union {
            let token = ref_sent[index].as_str();
            match (cand_counts.get_mut(token), ref_counts.get_mut(token)) {
                (Some(c), Some(r)) if *c > 0 && *r > 0 => {
                    *c -= 1;
                    *r -= 1;
                    hits += 1;
                }
                _ => {}
            }
        }
    }

    f_measure(hits, cand_len, ref_len)
}

/// `rouge1` and `rougeL` F-measures
pub fn rouge(candidate: &str, reference: &str) -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("rouge1".to_string(), rouge1(candidate, reference)),
        ("rougeL".to_string(), rouge_lsum(candidate, reference)),
    ])
}

/// Sentence-embedding source
pub trait Embed {
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>, MetricError>> + Send;
}

/// Embeddings from the local daemon's `/api/embeddings` endpoint
pub struct OllamaEmbedder {
    http: reqwest::Client,
    url: String,
    model: String,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig, timeout: Duration) -> Result<Self, MetricError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| MetricError::Embedding(err.to_string()))?;
        Ok(Self {
            http,
            url: format!("{}/api/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
        })
    }
}

impl Embed for OllamaEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, MetricError> {
        let request = EmbeddingRequest {
            model: &self.model,
            prompt: text,
        };
        let response: EmbeddingResponse = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|err| MetricError::Embedding(err.to_string()))?
            .error_for_status()
            .map_err(|err| MetricError::Embedding(err.to_string()))?
            .json()
            .await
            .map_err(|err| MetricError::Embedding(err.to_string()))?;

        debug!(model = %self.model, dims = response.embedding.len(), "embedding received");
        Ok(response.embedding)
    }
}

fn l2_normalized(vector: Vec<f32>) -> Result<Vec<f64>, MetricError> {
    if vector.is_empty() {
        return Err(MetricError::EmptyEmbedding);
    }
    let values: Vec<f64> = vector.into_iter().map(f64::from).collect();
    let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return Err(MetricError::ZeroNorm);
    }
    Ok(values.into_iter().map(|v| v / norm).collect())
}

/// Dot product of the L2-normalized embeddings, in [-1, 1]
pub fn cosine_of(left: Vec<f32>, right: Vec<f32>) -> Result<f64, MetricError> {
    if left.len() != right.len() {
        return Err(MetricError::DimensionMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    let left = l2_normalized(left)?;
    let right = l2_normalized(right)?;
    let dot: f64 = left.iter().zip(&right).map(|(a, b)| a * b).sum();
    Ok(dot.clamp(-1.0, 1.0))
}

pub async fn cosine<E: Embed>(
    embedder: &E,
    candidate: &str,
    reference: &str,
) -> Result<f64, MetricError> {
    let left = embedder.embed(candidate).await?;
    let right = embedder.embed(reference).await?;
    cosine_of(left, right)
}

/// Metric values and per-metric failures for one candidate/reference pair
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricReport {
    pub values: BTreeMap<String, f64>,
    pub errors: BTreeMap<String, String>,
}

/// Run every requested metric; a failing metric never prevents the others
pub async fn evaluate_metrics<E: Embed>(
    requested: &[MetricKind],
    candidate: &str,
    reference: &str,
    embedder: &E,
) -> MetricReport {
    let mut report = MetricReport::default();
    for kind in requested {
        match kind {
            MetricKind::Bleu => {
                report.values.insert("bleu".into(), bleu(candidate, reference));
            }
            MetricKind::Rouge => report.values.extend(rouge(candidate, reference)),
            MetricKind::Cosine => match cosine(embedder, candidate, reference).await {
                Ok(value) => {
                    report.values.insert("cosine".into(), value);
                }
                Err(err) => {
                    warn!(metric = kind.as_str(), error = %err, "metric failed");
                    report.errors.insert(kind.as_str().into(), err.to_string());
                }
            },
        }
    }
    report
}
