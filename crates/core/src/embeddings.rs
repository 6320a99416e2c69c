use crate::error::EmbeddingError;
use crate::store::SparseVector;
use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

const DEFAULT: usize = 128;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = DEFAULT;

#[async_trait]
pub trait Embedder: Send + Sync {
    fn model_id(&self) -> &str;
    fn tokenizer_family(&self) -> &str;
    fn dimensions(&self) -> usize;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[async_trait]
pub trait SparseEmbedder: Send + Sync {
    fn model_id(&self) -> &str;
    async fn embed_sparse(&self, texts: &[String]) -> Result<Vec<SparseVector>, EmbeddingError>;
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = 1469598103934665603u64;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(1099511628211);
    }
    hash
}

/// Offline dense embedder: hashed character trigrams, L2-normalised.
#[derive(Debug, Clone)]
pub struct CharacterNgramEmbedder {
    dimensions: usize,
    model_id: String,
}

impl CharacterNgramEmbedder {
    pub fn new(dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        Self {
            dimensions,
            model_id: format!("char-ngram-{dimensions}"),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let chars: Vec<char> = lowered.chars().collect();

        if chars.is_empty() {
            return vector;
        }

        for window in chars.windows(3) {
            let token = window.iter().collect::<String>();
            let bucket = (fnv1a(token.as_bytes()) % vector.len() as u64) as usize;
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

impl Default for CharacterNgramEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMENSIONS)
    }
}

#[async_trait]
impl Embedder for CharacterNgramEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn tokenizer_family(&self) -> &str {
        "word"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

/// Lexical sparse vectors: hashed lowercase terms weighted by `1 + ln(tf)`.
#[derive(Debug, Clone)]
pub struct HashedTermEmbedder {
    model_id: String,
    term: Regex,
}

impl HashedTermEmbedder {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            model_id: "term-hash-v1".to_string(),
            term: Regex::new(r"\w+")?,
        })
    }

    pub fn embed_text(&self, text: &str) -> SparseVector {
        let lowered = text.to_lowercase();
        let mut frequencies = BTreeMap::<u32, u32>::new();
        for found in self.term.find_iter(&lowered) {
            let index = (fnv1a(found.as_str().as_bytes()) & u64::from(u32::MAX)) as u32;
            *frequencies.entry(index).or_default() += 1;
        }

        let (indices, values) = frequencies
            .into_iter()
            .map(|(index, count)| (index, 1.0 + (count as f32).ln()))
            .unzip();
        SparseVector { indices, values }
    }
}

#[async_trait]
impl SparseEmbedder for HashedTermEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn embed_sparse(&self, texts: &[String]) -> Result<Vec<SparseVector>, EmbeddingError> {
        Ok(texts.iter().map(|text| self.embed_text(text)).collect())
    }
}

#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
    pub tokenizer_family: String,
    pub timeout: Duration,
    pub max_retries: usize,
}

/// Client for OpenAI-compatible `/embeddings` endpoints.
#[derive(Debug, Clone)]
pub struct HttpEmbedder {
    client: Client,
    config: HttpEmbedderConfig,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self, EmbeddingError> {
        if config.model.trim().is_empty() {
            return Err(EmbeddingError::Request("missing embedding model name".to_string()));
        }
        url::Url::parse(&config.endpoint)
            .map_err(|error| EmbeddingError::Request(format!("invalid endpoint: {error}")))?;

        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            client,
            config: HttpEmbedderConfig {
                max_retries: config.max_retries.max(1),
                ..config
            },
        })
    }

    async fn request_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut request = self.client.post(&self.config.endpoint).json(&EmbeddingRequest {
            model: &self.config.model,
            input: texts,
        });
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let details = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(EmbeddingError::BackendResponse {
                status: status.as_u16(),
                details,
            });
        }

        let mut payload: EmbeddingResponse = response.json().await?;
        if payload.data.len() != texts.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: texts.len(),
                got: payload.data.len(),
            });
        }
        payload.data.sort_by_key(|item| item.index);

        payload
            .data
            .into_iter()
            .map(|item| {
                if item.embedding.len() == self.config.dimensions {
                    Ok(item.embedding)
                } else {
                    Err(EmbeddingError::DimensionMismatch {
                        expected: self.config.dimensions,
                        got: item.embedding.len(),
                    })
                }
            })
            .collect()
    }
}

fn should_retry(error: &EmbeddingError) -> bool {
    match error {
        EmbeddingError::Http(error) => error.is_connect() || error.is_timeout() || error.is_body(),
        EmbeddingError::BackendResponse { status, .. } => {
            *status == StatusCode::TOO_MANY_REQUESTS.as_u16() || *status >= 500
        }
        _ => false,
    }
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    fn tokenizer_family(&self) -> &str {
        &self.config.tokenizer_family
    }

    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut attempt = 0usize;
        loop {
            match self.request_once(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(error) if should_retry(&error) && attempt + 1 < self.config.max_retries => {
                    attempt += 1;
                    warn!(model = %self.config.model, attempt, %error, "retrying embedding request");
                    tokio::time::sleep(retry_backoff(attempt)).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
