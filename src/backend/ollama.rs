use super::{BackendError, BackendSettings, FragmentStream, Generate, post_json};
use crate::models::{
    GenerationParameters, GenerationResult, RAW_PREVIEW_CHARS, SamplingParams, TokenLimits, Usage,
    preview,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

/// Local generation daemon (`/api/generate`)
pub struct OllamaBackend {
    http: reqwest::Client,
    url: String,
    limits: TokenLimits,
    stream_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

/// One decoded NDJSON line of a streaming response
#[derive(Debug, Clone, PartialEq)]
pub struct StreamLine {
    /// New text carried by the line, if any
    pub fragment: Option<String>,
    /// Provider-signaled completion
    pub done: bool,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    done: bool,
}

/// Decode one line; blank and malformed lines yield `None` and are skipped by the caller
pub fn decode_stream_line(line: &str) -> Option<StreamLine> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let chunk: StreamChunk = serde_json::from_str(line).ok()?;
    Some(StreamLine {
        fragment: chunk.response.filter(|text| !text.is_empty()),
        done: chunk.done,
    })
}

/// Longest NDJSON line buffered while waiting for its newline
const MAX_LINE_BYTES: usize = 1024 * 1024;

struct LineReader<S> {
    bytes: S,
    buffer: Vec<u8>,
    finished: bool,
}

/// Turn a byte stream of newline-delimited JSON into text fragments.
///
/// Ends at the first line with `done: true` or when the byte stream ends, whichever is first.
/// A line longer than [`MAX_LINE_BYTES`] ends the stream with a malformed-envelope error.
fn ndjson_fragments<S, B, E>(bytes: S) -> BoxStream<'static, Result<String, BackendError>>
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<BackendError> + Send + 'static,
{
    let reader = LineReader {
        bytes: Box::pin(bytes),
        buffer: Vec::new(),
        finished: false,
    };

    stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.finished {
                return None;
            }

            if let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buffer.drain(..=pos).collect();
                let Some(decoded) = decode_stream_line(&String::from_utf8_lossy(&line)) else {
                    continue;
                };
                reader.finished = decoded.done;
                match decoded.fragment {
                    Some(fragment) => return Some((Ok(fragment), reader)),
                    None => continue,
                }
            }

            if reader.buffer.len() > MAX_LINE_BYTES {
                reader.finished = true;
                let head = &reader.buffer[..RAW_PREVIEW_CHARS];
                let err = BackendError::malformed(
                    format!("stream line exceeds {MAX_LINE_BYTES} bytes"),
                    &String::from_utf8_lossy(head),
                );
                reader.buffer.clear();
                return Some((Err(err), reader));
            }

            match reader.bytes.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(chunk.as_ref()),
                Some(Err(err)) => {
                    reader.finished = true;
                    return Some((Err(err.into()), reader));
                }
                None => {
                    // Trailing line without a newline terminator.
                    reader.finished = true;
                    let rest = std::mem::take(&mut reader.buffer);
                    let fragment = decode_stream_line(&String::from_utf8_lossy(&rest))
                        .and_then(|decoded| decoded.fragment)?;
                    return Some((Ok(fragment), reader));
                }
            }
        }
    })
    .boxed()
}

impl OllamaBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        Ok(Self {
            http: settings.http_client()?,
            url: format!("{}/api/generate", settings.ollama_base_url.trim_end_matches('/')),
            limits: settings.limits,
            stream_timeout: settings.stream_timeout,
        })
    }

    fn payload(model: &str, prompt: &str, p: &SamplingParams, stream: bool) -> Value {
        json!({
            "model": model,
            "prompt": prompt,
            "stream": stream,
            "options": {
                "temperature": p.temperature,
                "top_p": p.top_p,
                "top_k": p.top_k,
                "num_predict": p.max_new_tokens,
            }
        })
    }

    /// Open a streaming generation and yield fragments as lines arrive
    pub async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<FragmentStream, BackendError> {
        let p = params.normalize(&self.limits);
        let response = self
            .http
            .post(&self.url)
            .timeout(self.stream_timeout)
            .json(&Self::payload(model, prompt, &p, true))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body: preview(&body, RAW_PREVIEW_CHARS),
            });
        }

        debug!(backend = "ollama", model, "stream opened");
        Ok(ndjson_fragments(response.bytes_stream()))
    }
}

impl Generate for OllamaBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        let p = params.normalize(&self.limits);
        let payload = Self::payload(model, prompt, &p, false);

        let response = post_json::<OllamaResponse>(&self.http, &self.url, None, &payload).await?;
        debug!(backend = "ollama", model, latency_ms = response.latency_ms, "generation finished");

        let body = response.body;
        let usage = match (body.prompt_eval_count, body.eval_count) {
            (None, None) => None,
            (prompt_tokens, completion_tokens) => Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens.zip(completion_tokens).map(|(a, b)| a + b),
            }),
        };

        Ok(GenerationResult {
            text: body.response.unwrap_or_default().trim().to_string(),
            latency_ms: response.latency_ms,
            finish_reason: body.done_reason,
            usage,
        })
    }
}
