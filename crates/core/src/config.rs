//! TOML configuration for the whole pipeline.
//!
//! Every section and field has a default, so an empty file (or no file) is a valid
//! configuration. Durations are written as plain integers in the unit named by the
//! field suffix.

use crate::error::ConfigError;
use crate::indexer::{IndexerOptions, RetryPolicy, MAX_BATCH_SIZE, MIN_BATCH_SIZE};
use crate::models::ChunkingPolicy;
use crate::orchestrator::ConversionOptions;
use crate::retrieval::RetrievalOptions;
use crate::store::OnDiskFlags;
use crate::windows::WindowingOptions;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub windowing: WindowingOptions,
    pub conversion: ConversionConfig,
    pub chunking: ChunkingPolicy,
    pub collection: CollectionConfig,
    pub indexer: IndexerConfig,
    pub retrieval: RetrievalConfig,
    pub qdrant: QdrantConfig,
    pub embedding: EmbeddingConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConverterBackend {
    #[default]
    Lopdf,
    Http,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConversionConfig {
    pub backend: ConverterBackend,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub max_workers: usize,
    #[serde_as(as = "Vec<DurationMilliSeconds<u64>>")]
    pub retry_delays_ms: Vec<Duration>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub window_timeout_secs: Duration,
    pub max_seam_chars: usize,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        let options = ConversionOptions::default();
        Self {
            backend: ConverterBackend::Lopdf,
            endpoint: None,
            api_key: None,
            max_workers: options.max_workers,
            retry_delays_ms: options.retry_delays,
            window_timeout_secs: options.window_timeout,
            max_seam_chars: options.max_seam_chars,
        }
    }
}

impl ConversionConfig {
    pub fn options(&self) -> ConversionOptions {
        ConversionOptions {
            max_workers: self.max_workers,
            retry_delays: self.retry_delays_ms.clone(),
            window_timeout: self.window_timeout_secs,
            max_seam_chars: self.max_seam_chars,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollectionConfig {
    pub prefix: String,
    pub on_disk: OnDiskFlags,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            prefix: "shelf".to_string(),
            on_disk: OnDiskFlags::default(),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IndexerConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub base_delay_ms: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        let options = IndexerOptions::default();
        Self {
            batch_size: options.batch_size,
            max_retries: options.retry.max_retries,
            base_delay_ms: options.retry.base_delay,
        }
    }
}

impl IndexerConfig {
    pub fn options(&self, on_disk: OnDiskFlags) -> IndexerOptions {
        IndexerOptions {
            batch_size: self.batch_size,
            retry: RetryPolicy {
                max_retries: self.max_retries,
                base_delay: self.base_delay_ms,
            },
            on_disk,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrievalConfig {
    pub max_top_k: usize,
    pub k_rrf: u32,
    pub max_chars: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub dense_timeout_secs: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hybrid_timeout_secs: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        let options = RetrievalOptions::default();
        Self {
            max_top_k: options.max_top_k,
            k_rrf: options.k_rrf,
            max_chars: options.max_chars,
            dense_timeout_secs: options.dense_timeout,
            hybrid_timeout_secs: options.hybrid_timeout,
        }
    }
}

impl RetrievalConfig {
    pub fn options(&self) -> RetrievalOptions {
        RetrievalOptions {
            max_top_k: self.max_top_k,
            k_rrf: self.k_rrf,
            max_chars: self.max_chars,
            dense_timeout: self.dense_timeout_secs,
            hybrid_timeout: self.hybrid_timeout_secs,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QdrantConfig {
    pub url: String,
    pub api_key: Option<String>,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout_secs: Duration,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            timeout_secs: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Offline hashed character trigrams.
    #[default]
    Ngram,
    /// OpenAI-compatible `/embeddings` endpoint.
    Http,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProvider,
    pub dimensions: usize,
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub tokenizer_family: String,
    /// Adds hashed-term sparse vectors, enabling hybrid search.
    pub sparse: bool,
    pub max_retries: usize,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout_secs: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::Ngram,
            dimensions: crate::embeddings::DEFAULT_EMBEDDING_DIMENSIONS,
            endpoint: None,
            model: None,
            api_key: None,
            tokenizer_family: "word".to_string(),
            sparse: true,
            max_retries: 3,
            timeout_secs: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuditConfig {
    /// JSON-lines file; auditing is off when unset.
    pub path: Option<PathBuf>,
}

impl PipelineConfig {
    /// Reads `path`, or returns defaults when it is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            debug!("no config file given, using defaults");
            return Ok(Self::default());
        };

        debug!(config = %path.display(), "loading config");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.windowing.window_size == 0 {
            return Err(ConfigError::Invalid(
                "windowing.window_size must be > 0".to_string(),
            ));
        }
        if self.windowing.overlap_pages >= self.windowing.window_size {
            return Err(ConfigError::Invalid(
                "windowing.overlap_pages must be smaller than window_size".to_string(),
            ));
        }
        if self.conversion.max_workers == 0 {
            return Err(ConfigError::Invalid(
                "conversion.max_workers must be > 0".to_string(),
            ));
        }
        if self.conversion.backend == ConverterBackend::Http && self.conversion.endpoint.is_none() {
            return Err(ConfigError::Invalid(
                "conversion.endpoint is required for the http backend".to_string(),
            ));
        }
        if self.chunking.max_tokens == 0 || self.chunking.overlap_tokens >= self.chunking.max_tokens
        {
            return Err(ConfigError::Invalid(
                "chunking.overlap_tokens must be smaller than a positive max_tokens".to_string(),
            ));
        }
        if !(MIN_BATCH_SIZE..=MAX_BATCH_SIZE).contains(&self.indexer.batch_size) {
            return Err(ConfigError::Invalid(format!(
                "indexer.batch_size must be within {MIN_BATCH_SIZE}..={MAX_BATCH_SIZE}"
            )));
        }
        if self.retrieval.max_top_k == 0 {
            return Err(ConfigError::Invalid(
                "retrieval.max_top_k must be >= 1".to_string(),
            ));
        }
        if self.collection.prefix.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "collection.prefix must not be empty".to_string(),
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(ConfigError::Invalid(
                "embedding.dimensions must be > 0".to_string(),
            ));
        }
        if self.embedding.provider == EmbeddingProvider::Http
            && (self.embedding.endpoint.is_none() || self.embedding.model.is_none())
        {
            return Err(ConfigError::Invalid(
                "embedding.endpoint and embedding.model are required for the http provider"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn empty_file_yields_defaults() {
        let config = PipelineConfig::from_toml_str("").expect("defaults are valid");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.windowing.window_size, 10);
        assert_eq!(config.chunking.max_tokens, 450);
        assert_eq!(config.indexer.batch_size, 256);
        assert_eq!(config.retrieval.max_top_k, 6);
        assert_eq!(config.retrieval.hybrid_timeout_secs, Duration::from_secs(20));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [windowing]
            window_size = 25
            force_windowed = true

            [conversion]
            retry_delays_ms = [10, 20]
            window_timeout_secs = 5

            [indexer]
            base_delay_ms = 250

            [collection]
            prefix = "lab"
            on_disk = { vectors = true }
            "#,
        )
        .expect("valid config");

        assert_eq!(config.windowing.window_size, 25);
        assert!(config.windowing.force_windowed);
        assert_eq!(config.windowing.threshold_pages, 1_000);
        assert_eq!(
            config.conversion.options().retry_delays,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(config.conversion.window_timeout_secs, Duration::from_secs(5));
        assert_eq!(
            config.indexer.options(config.collection.on_disk).retry.base_delay,
            Duration::from_millis(250)
        );
        assert!(config.collection.on_disk.vectors);
        assert!(!config.collection.on_disk.payload);
        assert_eq!(config.collection.prefix, "lab");
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            PipelineConfig::from_toml_str("[indexer]\nbatch_size = 10"),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PipelineConfig::from_toml_str("[conversion]\nbackend = \"http\""),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            PipelineConfig::from_toml_str("[windowing]\nwindow_size = \"ten\""),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn loads_from_file_or_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("docshelf.toml");
        std::fs::write(&path, "[retrieval]\nmax_chars = 900\n")?;

        assert_eq!(PipelineConfig::load(Some(&path))?.retrieval.max_chars, 900);
        assert_eq!(PipelineConfig::load(None)?, PipelineConfig::default());
        assert!(matches!(
            PipelineConfig::load(Some(&dir.path().join("missing.toml"))),
            Err(ConfigError::Io(_))
        ));
        Ok(())
    }
}
