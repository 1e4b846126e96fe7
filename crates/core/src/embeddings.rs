use crate::chunking::normalize_whitespace;
use crate::error::EmbeddingError;
use crate::models::EmbeddingOptions;
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 384;
pub const DEFAULT_MAX_INPUT_CHARS: usize = 8_000;

/// A backend that turns text into fixed-length vectors.
///
/// `embed` returns one entry per input, `None` where the backend produced
/// nothing for that text.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn is_available(&self) -> bool {
        true
    }

    fn max_input_chars(&self) -> usize {
        DEFAULT_MAX_INPUT_CHARS
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError>;
}

/// Hashed character-trigram vectors. Deterministic and offline, so it is
/// the default for local use and tests.
#[derive(Debug, Clone, Copy)]
pub struct CharacterNgramEmbedder {
    pub dimensions: usize,
}

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl CharacterNgramEmbedder {
    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions.max(1)];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let mut hash = 1469598103934665603u64;
            for byte in window.iter().collect::<String>().bytes() {
                hash ^= byte as u64;
                hash = hash.wrapping_mul(1099511628211);
            }
            let bucket = (hash % vector.len() as u64) as usize;
            vector[bucket] += 1.0;
        }

        let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }

        vector
    }
}

#[async_trait]
impl EmbeddingProvider for CharacterNgramEmbedder {
    fn name(&self) -> &str {
        "local-ngram"
    }

    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| Some(self.embed_text(text)))
            .collect())
    }
}

/// `POST {base_url}/embeddings` against an OpenAI-compatible API.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: Url,
    api_key: String,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimensions: usize,
    ) -> Result<Self, EmbeddingError> {
        let endpoint = endpoint_url(base_url, "embeddings")?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            api_key: api_key.into(),
            model: model.into(),
            dimensions,
        })
    }
}

/// Joins `path` under `base_url`, keeping any path prefix such as `/v1`.
pub(crate) fn endpoint_url(base_url: &str, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base_url.trim_end_matches('/').to_string();
    base.push('/');
    Url::parse(&base)?.join(path)
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn name(&self) -> &str {
        "openai"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_available(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "input": texts,
                "dimensions": self.dimensions,
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, body = %body, "embedding request rejected");
            return Err(EmbeddingError::BackendResponse {
                backend: "openai".to_string(),
                details: status.to_string(),
            });
        }

        let parsed: Value = response.json().await?;
        let data = parsed
            .pointer("/data")
            .and_then(Value::as_array)
            .ok_or_else(|| EmbeddingError::BackendResponse {
                backend: "openai".to_string(),
                details: "missing data array".to_string(),
            })?;

        let mut vectors = vec![None; texts.len()];
        for (position, item) in data.iter().enumerate() {
            let index = item
                .pointer("/index")
                .and_then(Value::as_u64)
                .map(|index| index as usize)
                .unwrap_or(position);
            let Some(slot) = vectors.get_mut(index) else {
                continue;
            };
            *slot = item.pointer("/embedding").and_then(Value::as_array).map(|values| {
                values
                    .iter()
                    .map(|value| value.as_f64().unwrap_or(0.0) as f32)
                    .collect()
            });
        }

        Ok(vectors)
    }
}

/// Stands in when no provider is configured; chunks are stored unembedded.
#[derive(Debug, Clone, Copy)]
pub struct DisabledEmbedder {
    pub dimensions: usize,
}

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn name(&self) -> &str {
        "disabled"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn is_available(&self) -> bool {
        false
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
        Err(EmbeddingError::Disabled)
    }
}

/// Batches texts for a provider, running up to `max_concurrent_batches`
/// requests at once. Output always lines up index-for-index with input.
pub struct EmbeddingEngine {
    provider: Arc<dyn EmbeddingProvider>,
    options: EmbeddingOptions,
}

impl EmbeddingEngine {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, options: EmbeddingOptions) -> Self {
        Self { provider, options }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_available()
    }

    pub fn dimensions(&self) -> usize {
        self.provider.dimensions()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn embed_one(&self, text: &str) -> Option<Vec<f32>> {
        self.embed_batch(&[text.to_string()]).await.pop().flatten()
    }

    pub async fn embed_batch(&self, texts: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut results = vec![None; texts.len()];
        if texts.is_empty() {
            return results;
        }
        if !self.is_available() {
            warn!(
                provider = self.provider_name(),
                text_count = texts.len(),
                "embedding provider unavailable, continuing without vectors"
            );
            return results;
        }

        let prepared: Vec<String> = texts.iter().map(|text| self.prepare(text)).collect();
        let batch_size = self.options.max_batch_size.max(1);
        let batches: Vec<(usize, &[String])> = prepared
            .chunks(batch_size)
            .enumerate()
            .map(|(number, batch)| (number * batch_size, batch))
            .collect();
        let group_size = self.options.max_concurrent_batches.max(1);

        for (group_number, group) in batches.chunks(group_size).enumerate() {
            if group_number > 0 && !self.options.inter_group_delay.is_zero() {
                tokio::time::sleep(self.options.inter_group_delay).await;
            }

            let outcomes = join_all(group.iter().map(|&(offset, batch)| async move {
                (offset, self.run_batch(offset, batch).await)
            }))
            .await;

            for (offset, vectors) in outcomes {
                for (position, vector) in vectors.into_iter().enumerate() {
                    results[offset + position] = vector;
                }
            }
        }

        let embedded = results.iter().filter(|vector| vector.is_some()).count();
        info!(
            provider = self.provider_name(),
            requested = texts.len(),
            embedded,
            batch_count = batches.len(),
            "embedding pass finished"
        );
        results
    }

    /// Embeds one batch. Failures and timeouts null the whole batch; vectors
    /// of the wrong length are nulled individually.
    async fn run_batch(&self, offset: usize, batch: &[String]) -> Vec<Option<Vec<f32>>> {
        let mut vectors = vec![None; batch.len()];
        let (positions, inputs): (Vec<usize>, Vec<String>) = batch
            .iter()
            .enumerate()
            .filter(|(_, text)| !text.is_empty())
            .map(|(position, text)| (position, text.clone()))
            .unzip();
        if inputs.is_empty() {
            return vectors;
        }

        let call = self.provider.embed(&inputs);
        let embedded = match tokio::time::timeout(self.options.batch_timeout, call).await {
            Err(_) => Err(EmbeddingError::Timeout(self.options.batch_timeout)),
            Ok(result) => result,
        };

        let embedded = match embedded {
            Ok(embedded) if embedded.len() == inputs.len() => embedded,
            Ok(embedded) => {
                warn!(
                    offset,
                    expected = inputs.len(),
                    actual = embedded.len(),
                    "embedding batch returned wrong number of vectors"
                );
                return vectors;
            }
            Err(error) => {
                warn!(offset, batch_len = batch.len(), %error, "embedding batch failed");
                return vectors;
            }
        };

        let dimensions = self.dimensions();
        for (position, vector) in positions.into_iter().zip(embedded) {
            vectors[position] = vector.filter(|vector| {
                let fits = vector.len() == dimensions;
                if !fits {
                    debug!(
                        index = offset + position,
                        expected = dimensions,
                        actual = vector.len(),
                        "dropping embedding of unexpected dimension"
                    );
                }
                fits
            });
        }
        vectors
    }

    fn prepare(&self, text: &str) -> String {
        let normalized = normalize_whitespace(text);
        let limit = self.provider.max_input_chars();
        if normalized.chars().count() <= limit {
            normalized
        } else {
            normalized.chars().take(limit).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if texts.iter().any(|text| text.contains("fail")) {
                return Err(EmbeddingError::BackendResponse {
                    backend: "flaky".to_string(),
                    details: "503".to_string(),
                });
            }
            Ok(texts
                .iter()
                .map(|text| {
                    if text.contains("wide") {
                        Some(vec![1.0, 0.0, 0.0])
                    } else {
                        Some(vec![text.len() as f32, 1.0])
                    }
                })
                .collect())
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl EmbeddingProvider for SlowProvider {
        fn name(&self) -> &str {
            "slow"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(vec![Some(vec![0.0, 1.0]); texts.len()])
        }
    }

    fn options(batch: usize, concurrent: usize) -> EmbeddingOptions {
        EmbeddingOptions {
            max_batch_size: batch,
            max_concurrent_batches: concurrent,
            inter_group_delay: Duration::ZERO,
            batch_timeout: Duration::from_millis(50),
        }
    }

    fn texts(items: &[&str]) -> Vec<String> {
        items.iter().map(|item| item.to_string()).collect()
    }

    #[test]
    fn ngram_embedder_is_deterministic() {
        let embedder = CharacterNgramEmbedder::default();
        let first = embedder.embed_text("Hydraulic pressure and flow");
        let second = embedder.embed_text("Hydraulic pressure and flow");
        assert_eq!(first, second);
        assert_eq!(first.len(), DEFAULT_EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn ngram_embedder_outputs_expected_length() {
        let embedder = CharacterNgramEmbedder { dimensions: 32 };
        assert_eq!(embedder.embed_text("abc").len(), 32);
    }

    #[tokio::test]
    async fn failed_batch_nulls_only_its_own_texts() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
        });
        let engine = EmbeddingEngine::new(provider.clone(), options(2, 2));

        let result = engine
            .embed_batch(&texts(&["alpha", "beta", "gamma", "fail here", "delta"]))
            .await;

        assert_eq!(result.len(), 5);
        assert_eq!(result[0], Some(vec![5.0, 1.0]));
        assert_eq!(result[1], Some(vec![4.0, 1.0]));
        assert_eq!(result[2], None);
        assert_eq!(result[3], None);
        assert_eq!(result[4], Some(vec![5.0, 1.0]));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn wrong_dimension_and_blank_text_are_nulled() {
        let provider = Arc::new(FlakyProvider {
            calls: AtomicUsize::new(0),
        });
        let engine = EmbeddingEngine::new(provider, options(10, 1));

        let result = engine
            .embed_batch(&texts(&["too wide", "   ", "ok  \n text"]))
            .await;

        assert_eq!(result[0], None);
        assert_eq!(result[1], None);
        assert_eq!(result[2], Some(vec![7.0, 1.0]));
    }

    #[tokio::test]
    async fn timed_out_batch_yields_nulls() {
        let engine = EmbeddingEngine::new(Arc::new(SlowProvider), options(1, 4));

        let result = engine.embed_batch(&texts(&["one", "two"])).await;

        assert_eq!(result, vec![None, None]);
    }

    #[tokio::test]
    async fn disabled_provider_reports_unavailable_and_returns_nulls() {
        let engine = EmbeddingEngine::new(
            Arc::new(DisabledEmbedder { dimensions: 8 }),
            EmbeddingOptions::default(),
        );

        assert!(!engine.is_available());
        assert_eq!(engine.embed_batch(&texts(&["a", "b"])).await, vec![None, None]);
        assert_eq!(engine.embed_one("a").await, None);
    }

    #[tokio::test]
    async fn input_is_truncated_to_provider_ceiling() {
        struct EchoLength;

        #[async_trait]
        impl EmbeddingProvider for EchoLength {
            fn name(&self) -> &str {
                "echo"
            }

            fn dimensions(&self) -> usize {
                1
            }

            fn max_input_chars(&self) -> usize {
                10
            }

            async fn embed(
                &self,
                texts: &[String],
            ) -> Result<Vec<Option<Vec<f32>>>, EmbeddingError> {
                Ok(texts
                    .iter()
                    .map(|text| Some(vec![text.chars().count() as f32]))
                    .collect())
            }
        }

        let engine = EmbeddingEngine::new(Arc::new(EchoLength), EmbeddingOptions::default());
        assert_eq!(engine.embed_one(&"word ".repeat(20)).await, Some(vec![10.0]));
    }

    #[test]
    fn endpoint_keeps_version_prefix() -> Result<(), url::ParseError> {
        assert_eq!(
            endpoint_url("https://api.openai.com/v1", "embeddings")?.as_str(),
            "https://api.openai.com/v1/embeddings"
        );
        assert_eq!(
            endpoint_url("http://localhost:8080/v1/", "embeddings")?.as_str(),
            "http://localhost:8080/v1/embeddings"
        );
        Ok(())
    }
}
