use super::{BackendError, BackendSettings, Generate, post_json};
use crate::models::{GenerationParameters, GenerationResult, TokenLimits, Usage};
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs,
};
use serde::Deserialize;
use tracing::debug;

/// OpenAI-compatible chat router (`/chat/completions`)
///
/// Builds requests with the `async-openai` types but sends through our own client: the stock
/// client retries rate-limited and 5xx responses internally, and this layer must not retry.
/// Replies are read leniently; only `choices[0].message.content` is required.
pub struct HfRouterBackend {
    http: reqwest::Client,
    url: String,
    token: Option<String>,
    limits: TokenLimits,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
    total_tokens: Option<u32>,
}

impl HfRouterBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, BackendError> {
        Ok(Self {
            http: settings.http_client()?,
            url: format!(
                "{}/chat/completions",
                settings.hf_router_base_url.trim_end_matches('/')
            ),
            token: settings.hf_token.clone(),
            limits: settings.limits,
        })
    }

    /// Build the chat completion request for a single user turn
    fn build_request(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<CreateChatCompletionRequest, BackendError> {
        let p = params.normalize(&self.limits);

        let user_message: ChatCompletionRequestMessage =
            ChatCompletionRequestUserMessageArgs::default()
                .content(prompt.to_string())
                .build()
                .map_err(|err| BackendError::Configuration(err.to_string()))?
                .into();

        CreateChatCompletionRequestArgs::default()
            .model(model)
            .messages([user_message])
            .temperature(p.temperature as f32)
            .top_p(p.top_p as f32)
            .max_tokens(p.max_new_tokens)
            .stream(false)
            .build()
            .map_err(|err| BackendError::Configuration(err.to_string()))
    }

    /// Extract a GenerationResult from the chat envelope
    fn extract_result(
        response: ChatResponse,
        latency_ms: u64,
    ) -> Result<GenerationResult, BackendError> {
        let ChatResponse { choices, usage } = response;
        let choice = choices
            .into_iter()
            .next()
            .ok_or_else(|| BackendError::malformed("response has no choices", ""))?;

        let usage = usage.map(|usage| Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        });

        Ok(GenerationResult {
            text: choice.message.content.trim().to_string(),
            latency_ms,
            finish_reason: choice.finish_reason,
            usage,
        })
    }
}

impl Generate for HfRouterBackend {
    async fn generate(
        &self,
        model: &str,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Result<GenerationResult, BackendError> {
        let request = self.build_request(model, prompt, params)?;
        let payload = serde_json::to_value(&request)
            .map_err(|err| BackendError::Configuration(err.to_string()))?;

        let response = post_json::<ChatResponse>(
            &self.http,
            &self.url,
            self.token.as_deref(),
            &payload,
        )
        .await?;
        debug!(backend = "hf_router", model, latency_ms = response.latency_ms, "generation finished");

        Self::extract_result(response.body, response.latency_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use mockito::Matcher;
    use serde_json::json;

    fn backend(base_url: &str) -> HfRouterBackend {
        let mut config = Config::default();
        config.backends.hf_router_base_url = base_url.to_string();
        let mut settings = BackendSettings::from_config(&config);
        settings.hf_token = Some("hf_router_token".to_string());
        HfRouterBackend::new(&settings).unwrap()
    }

    #[test]
    fn test_build_request_payload_shape() {
        let backend = backend("http://localhost:1/v1/");
        let request = backend
            .build_request("org/model", "Hello", &GenerationParameters::default())
            .unwrap();
        let payload = serde_json::to_value(&request).unwrap();

        assert_eq!(backend.url, "http://localhost:1/v1/chat/completions");
        assert_eq!(payload["model"], "org/model");
        assert_eq!(payload["messages"][0]["role"], "user");
        assert_eq!(payload["messages"][0]["content"], "Hello");
        assert_eq!(payload["max_tokens"], 256);
        assert_eq!(payload["stream"], false);
        assert!(payload.get("top_k").is_none());
    }

    #[tokio::test]
    async fn test_generate_reads_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer hf_router_token")
            .match_body(Matcher::PartialJson(json!({
                "model": "org/model",
                "messages": [{"role": "user", "content": "Hello"}],
                "stream": false
            })))
            .with_body(
                json!({
                    "id": "chatcmpl-1",
                    "object": "chat.completion",
                    "created": 1_700_000_000,
                    "model": "org/model",
                    "choices": [{
                        "index": 0,
                        "message": {"role": "assistant", "content": "  Hi!  "},
                        "finish_reason": "stop"
                    }],
                    "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
                })
                .to_string(),
            )
            .create_async()
            .await;

        let result = backend(&format!("{}/v1", server.url()))
            .generate("org/model", "Hello", &GenerationParameters::default())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(result.text, "Hi!");
        assert_eq!(result.finish_reason.as_deref(), Some("stop"));
        assert_eq!(result.usage.unwrap().total_tokens, Some(5));
    }

    #[tokio::test]
    async fn test_generate_rejects_envelope_without_choices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_body(r#"{"unexpected": true}"#)
            .create_async()
            .await;

        let result = backend(&format!("{}/v1", server.url()))
            .generate("org/model", "Hello", &GenerationParameters::default())
            .await;
        assert!(matches!(result, Err(BackendError::MalformedEnvelope { .. })));
    }

    async fn generate_with_reply(reply: serde_json::Value) -> Result<GenerationResult, BackendError> {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_body(reply.to_string())
            .create_async()
            .await;

        backend(&format!("{}/v1", server.url()))
            .generate("org/model", "Hello", &GenerationParameters::default())
            .await
    }

    #[tokio::test]
    async fn test_generate_accepts_minimal_envelope() {
        let result = generate_with_reply(json!({"choices": [{"message": {"content": "hi"}}]}))
            .await
            .unwrap();
        assert_eq!(result.text, "hi");
        assert!(result.finish_reason.is_none());
        assert!(result.usage.is_none());
    }

    #[tokio::test]
    async fn test_generate_keeps_nonstandard_finish_reason() {
        let result = generate_with_reply(json!({
            "id": "chatcmpl-2",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "org/model",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "done"},
                "finish_reason": "eos_token"
            }],
            "usage": {"prompt_tokens": 4, "completion_tokens": 1}
        }))
        .await
        .unwrap();
        assert_eq!(result.text, "done");
        assert_eq!(result.finish_reason.as_deref(), Some("eos_token"));
        let usage = result.usage.unwrap();
        assert_eq!(usage.completion_tokens, Some(1));
        assert_eq!(usage.total_tokens, None);
    }

    #[tokio::test]
    async fn test_generate_rejects_empty_choices() {
        let result = generate_with_reply(json!({"choices": []})).await;
        assert!(matches!(result, Err(BackendError::MalformedEnvelope { .. })));
    }
}
