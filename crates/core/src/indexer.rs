use crate::collections::{CollectionManager, ModelSpec};
use crate::error::{IngestError, StoreError};
use crate::models::{Chunk, CollectionBinding};
use crate::store::{point_id, OnDiskFlags, Point, PointVectors, SparseVector};
use crate::traits::VectorStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MIN_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 500;
pub const DEFAULT_BATCH_SIZE: usize = 256;

/// A chunk with its vectors, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub dense: Vec<f32>,
    pub sparse: Option<SparseVector>,
}

/// Exponential backoff for transient store failures: `base_delay * 2^n` before retry `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerOptions {
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub on_disk: OnDiskFlags,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryPolicy::default(),
            on_disk: OnDiskFlags::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexOutcome {
    pub binding: CollectionBinding,
    pub written: usize,
}

pub struct Indexer {
    store: Arc<dyn VectorStore>,
    collections: Arc<CollectionManager>,
    options: IndexerOptions,
}

impl Indexer {
    pub fn new(
        store: Arc<dyn VectorStore>,
        collections: Arc<CollectionManager>,
        options: IndexerOptions,
    ) -> Self {
        Self {
            store,
            collections,
            options,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.options.batch_size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
    }

    /// Runs the write-guard for `project_id` without writing anything.
    pub async fn prepare(
        &self,
        project_id: &str,
        models: &ModelSpec,
        migrate: bool,
    ) -> Result<CollectionBinding, IngestError> {
        Ok(self
            .collections
            .ensure_collection(project_id, models, self.options.on_disk, migrate)
            .await?)
    }

    /// Writes `items` into the project's collection in batches. Re-running with the
    /// same chunks overwrites the same points.
    pub async fn upsert(
        &self,
        project_id: &str,
        items: &[EmbeddedChunk],
        models: &ModelSpec,
        migrate: bool,
    ) -> Result<IndexOutcome, IngestError> {
        validate(items, models)?;
        let binding = self.prepare(project_id, models, migrate).await?;

        let batch_size = self.batch_size();
        let mut committed = 0usize;

        for (batch_index, batch) in items.chunks(batch_size).enumerate() {
            let points: Vec<Point> = batch
                .iter()
                .map(|item| Point {
                    id: point_id(&item.chunk.id),
                    vectors: PointVectors {
                        dense: item.dense.clone(),
                        sparse: item.sparse.clone(),
                    },
                    payload: chunk_payload(project_id, item, models),
                })
                .collect();

            match self.write_batch(&binding.collection_name, &points).await {
                Ok(()) => {
                    committed += points.len();
                    debug!(
                        collection = %binding.collection_name,
                        batch = batch_index,
                        committed,
                        "batch written"
                    );
                }
                Err(source) if source.is_transient() => {
                    warn!(
                        collection = %binding.collection_name,
                        committed,
                        error = %source,
                        "store retries exhausted"
                    );
                    return Err(IngestError::StoreExhausted { committed, source });
                }
                Err(source) => {
                    warn!(
                        collection = %binding.collection_name,
                        committed,
                        error = %source,
                        "store rejected batch"
                    );
                    return Err(IngestError::Store(source));
                }
            }
        }

        info!(
            project_id,
            collection = %binding.collection_name,
            written = committed,
            "chunks indexed"
        );

        Ok(IndexOutcome {
            binding,
            written: committed,
        })
    }

    async fn write_batch(&self, collection: &str, points: &[Point]) -> Result<(), StoreError> {
        let policy = self.options.retry;
        let mut retry = 0u32;

        loop {
            match self.store.upsert_points(collection, points).await {
                Ok(()) => return Ok(()),
                Err(error) if error.is_transient() && retry < policy.max_retries => {
                    let delay = policy.delay_for(retry);
                    retry += 1;
                    warn!(
                        collection,
                        retry,
                        delay_ms = delay.as_millis() as u64,
                        %error,
                        "transient store error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

fn validate(items: &[EmbeddedChunk], models: &ModelSpec) -> Result<(), IngestError> {
    for item in items {
        if item.dense.len() != models.dense_dimensions {
            return Err(IngestError::InvalidArgument(format!(
                "chunk {} has a {}-dimensional vector, model `{}` is bound with {}",
                item.chunk.id,
                item.dense.len(),
                models.dense_model_id,
                models.dense_dimensions
            )));
        }
        if item.sparse.is_some() && models.sparse_model_id.is_none() {
            return Err(IngestError::InvalidArgument(format!(
                "chunk {} carries a sparse vector but no sparse model is configured",
                item.chunk.id
            )));
        }
    }
    Ok(())
}

fn chunk_payload(project_id: &str, item: &EmbeddedChunk, models: &ModelSpec) -> Value {
    let chunk = &item.chunk;
    let citation = chunk.citation.clone().unwrap_or_default();
    let citekey = (!citation.citekey.is_empty()).then_some(citation.citekey);

    json!({
        "project_id": project_id,
        "doc_id": chunk.doc_id,
        "chunk_id": chunk.id,
        "text": chunk.text,
        "context_prefix": chunk.context_prefix,
        "page_start": chunk.page_span.start,
        "page_end": chunk.page_span.end,
        "section_heading": chunk.section_heading,
        "section_path": chunk.section_path,
        "chunk_idx": chunk.chunk_idx,
        "token_count": chunk.token_count,
        "signal_to_noise": chunk.signal_to_noise,
        "dense_model": models.dense_model_id,
        "sparse_model": models.sparse_model_id,
        "citekey": citekey,
        "title": citation.title,
        "authors": citation.authors,
        "year": citation.year,
        "doi": citation.doi,
        "url": citation.url,
        "tags": citation.tags,
        "collections": citation.collections,
    })
}
