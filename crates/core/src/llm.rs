use crate::embeddings::endpoint_url;
use crate::error::ModelError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.9,
            max_output_tokens: 2048,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub system: String,
    pub prompt: String,
    pub params: GenerationParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Generation {
    /// Builds a generation, estimating token counts from whitespace-separated
    /// words when the backend did not report usage.
    fn with_usage(
        text: String,
        request: &GenerationRequest,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    ) -> Self {
        let prompt_tokens = prompt_tokens.map(|count| count as usize).unwrap_or_else(|| {
            request.system.split_whitespace().count() + request.prompt.split_whitespace().count()
        });
        let completion_tokens = completion_tokens
            .map(|count| count as usize)
            .unwrap_or_else(|| text.split_whitespace().count());
        Self {
            text,
            prompt_tokens,
            completion_tokens,
        }
    }
}

/// A backend that turns a system instruction and a prompt into text.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ModelError>;
}

fn rejected(backend: &str, details: impl Into<String>) -> ModelError {
    ModelError::BackendResponse {
        backend: backend.to_string(),
        details: details.into(),
    }
}

/// OpenAI-compatible `chat/completions` endpoint.
pub struct OpenAiChatModel {
    client: Client,
    endpoint: url::Url,
    api_key: String,
}

impl OpenAiChatModel {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ModelError> {
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint_url(base_url, "chat/completions")?,
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        "openai"
    }

    fn is_available(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ModelError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": request.model,
                "messages": [
                    {"role": "system", "content": request.system},
                    {"role": "user", "content": request.prompt},
                ],
                "temperature": request.params.temperature,
                "top_p": request.params.top_p,
                "max_tokens": request.params.max_output_tokens,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, model = %request.model, body = %body, "chat completion rejected");
            return Err(rejected("openai", status.to_string()));
        }

        let parsed: Value = response.json().await?;
        let text = parsed
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| rejected("openai", "missing message content"))?
            .to_string();
        debug!(model = %request.model, chars = text.len(), "chat completion received");

        Ok(Generation::with_usage(
            text,
            request,
            parsed.pointer("/usage/prompt_tokens").and_then(Value::as_u64),
            parsed.pointer("/usage/completion_tokens").and_then(Value::as_u64),
        ))
    }
}

/// Google Gemini `generateContent` endpoint. The model is part of the path,
/// so the url is built per request.
pub struct GeminiModel {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiModel {
    pub fn new(base_url: &str, api_key: impl Into<String>) -> Result<Self, ModelError> {
        // Fail on a malformed base url at construction rather than on first use.
        endpoint_url(base_url, "models")?;
        Ok(Self {
            client: Client::new(),
            base_url: base_url.to_string(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl LanguageModel for GeminiModel {
    fn name(&self) -> &str {
        "gemini"
    }

    fn is_available(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ModelError> {
        let endpoint = endpoint_url(
            &self.base_url,
            &format!("models/{}:generateContent", request.model),
        )?;
        let response = self
            .client
            .post(endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&json!({
                "systemInstruction": {"parts": [{"text": request.system}]},
                "contents": [{"role": "user", "parts": [{"text": request.prompt}]}],
                "generationConfig": {
                    "temperature": request.params.temperature,
                    "topP": request.params.top_p,
                    "maxOutputTokens": request.params.max_output_tokens,
                },
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, model = %request.model, body = %body, "gemini request rejected");
            return Err(rejected("gemini", status.to_string()));
        }

        let parsed: Value = response.json().await?;
        let text = parsed
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|part| part.pointer("/text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| rejected("gemini", "no candidate text"))?;

        Ok(Generation::with_usage(
            text,
            request,
            parsed.pointer("/usageMetadata/promptTokenCount").and_then(Value::as_u64),
            parsed
                .pointer("/usageMetadata/candidatesTokenCount")
                .and_then(Value::as_u64),
        ))
    }
}

/// Used when no model is configured; every answer becomes the fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledModel;

#[async_trait]
impl LanguageModel for DisabledModel {
    fn name(&self) -> &str {
        "disabled"
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, ModelError> {
        Err(ModelError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            model: "m".to_string(),
            system: "be brief".to_string(),
            prompt: "what is a lever".to_string(),
            params: GenerationParams::default(),
        }
    }

    #[test]
    fn usage_falls_back_to_word_counts() {
        let generation =
            Generation::with_usage("a simple machine".to_string(), &request(), None, None);
        assert_eq!(generation.prompt_tokens, 6);
        assert_eq!(generation.completion_tokens, 3);

        let reported = Generation::with_usage("x".to_string(), &request(), Some(40), Some(7));
        assert_eq!((reported.prompt_tokens, reported.completion_tokens), (40, 7));
    }

    #[test]
    fn availability_follows_api_key() -> Result<(), ModelError> {
        assert!(!OpenAiChatModel::new(DEFAULT_OPENAI_BASE_URL, " ")?.is_available());
        assert!(GeminiModel::new(DEFAULT_GEMINI_BASE_URL, "key")?.is_available());
        assert!(OpenAiChatModel::new("not a url", "key").is_err());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_model_refuses() {
        let result = DisabledModel.generate(&request()).await;
        assert!(matches!(result, Err(ModelError::Disabled)));
    }

    #[test]
    fn gemini_path_keeps_version_prefix() -> Result<(), url::ParseError> {
        let url = endpoint_url(DEFAULT_GEMINI_BASE_URL, "models/gemini-1.5-flash:generateContent")?;
        assert_eq!(
            url.as_str(),
            concat!(
                "https://generativelanguage.googleapis.com/v1beta",
                "/models/gemini-1.5-flash:generateContent"
            )
        );
        Ok(())
    }
}
