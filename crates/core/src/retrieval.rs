//! Project-scoped dense and hybrid retrieval.
//!
//! Hybrid mode queries the dense and sparse slots of the same collection and fuses
//! the two ranked lists with reciprocal rank fusion. Every store query carries the
//! project filter, and hits that come back from another project are dropped anyway.

use crate::collections::{CollectionManager, ModelSpec};
use crate::embeddings::{Embedder, SparseEmbedder};
use crate::error::{EmbeddingError, SearchError, StoreError};
use crate::models::{QueryResponse, SearchHit, SearchMode, SearchQuery};
use crate::store::{PointFilter, QueryVector, ScoredPoint, StoreSearch, FIELD_PROJECT_ID};
use crate::traits::VectorStore;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const TRUNCATION_MARKER: &str = " …";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrievalOptions {
    pub max_top_k: usize,
    pub k_rrf: u32,
    pub max_chars: usize,
    pub dense_timeout: Duration,
    pub hybrid_timeout: Duration,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            max_top_k: 6,
            k_rrf: 60,
            max_chars: 1_800,
            dense_timeout: Duration::from_secs(10),
            hybrid_timeout: Duration::from_secs(20),
        }
    }
}

pub struct RetrievalEngine {
    store: Arc<dyn VectorStore>,
    collections: Arc<CollectionManager>,
    dense: Arc<dyn Embedder>,
    sparse: Option<Arc<dyn SparseEmbedder>>,
    options: RetrievalOptions,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<dyn VectorStore>,
        collections: Arc<CollectionManager>,
        dense: Arc<dyn Embedder>,
        sparse: Option<Arc<dyn SparseEmbedder>>,
        options: RetrievalOptions,
    ) -> Self {
        Self {
            store,
            collections,
            dense,
            sparse,
            options,
        }
    }

    pub async fn search(&self, query: &SearchQuery) -> Result<QueryResponse, SearchError> {
        if query.project_id.trim().is_empty() {
            return Err(SearchError::Request("project id is empty".to_string()));
        }
        if query.text.trim().is_empty() {
            return Err(SearchError::Request("query is empty".to_string()));
        }

        let budget = match query.mode {
            SearchMode::Dense => self.options.dense_timeout,
            SearchMode::Hybrid => self.options.hybrid_timeout,
        };
        let started = Instant::now();

        match tokio::time::timeout(budget, self.run(query)).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = started.elapsed();
                warn!(
                    project_id = %query.project_id,
                    mode = %query.mode,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "query timed out"
                );
                Err(SearchError::Timeout { elapsed })
            }
        }
    }

    async fn run(&self, query: &SearchQuery) -> Result<QueryResponse, SearchError> {
        let top_k = query.top_k.clamp(1, self.options.max_top_k.max(1));
        let hybrid = query.mode == SearchMode::Hybrid;

        let models = ModelSpec {
            dense_model_id: self.dense.model_id().to_string(),
            dense_dimensions: self.dense.dimensions(),
            sparse_model_id: self.sparse.as_ref().map(|sparse| sparse.model_id().to_string()),
        };
        let binding = self
            .collections
            .resolve_for_query(&query.project_id, &models, hybrid)
            .await?;

        let filter = PointFilter::for_project(&query.project_id).with_query_filters(&query.filters);
        let texts = [query.text.clone()];
        let dense_vector = first(self.dense.embed(&texts).await?)?;

        let ranked = match (hybrid, &self.sparse) {
            (true, Some(sparse)) => {
                let candidate_k = (top_k * 4).max(20);
                let sparse_vector = first(sparse.embed_sparse(&texts).await?)?;

                let dense_request = StoreSearch {
                    vector: QueryVector::Dense(dense_vector),
                    filter: filter.clone(),
                    limit: candidate_k,
                };
                let sparse_request = StoreSearch {
                    vector: QueryVector::Sparse(sparse_vector),
                    filter,
                    limit: candidate_k,
                };
                let (dense_hits, sparse_hits) = tokio::try_join!(
                    self.store.search(&binding.collection_name, &dense_request),
                    self.store.search(&binding.collection_name, &sparse_request)
                )?;
                debug!(
                    dense = dense_hits.len(),
                    sparse = sparse_hits.len(),
                    candidate_k,
                    "fusing ranked lists"
                );

                let dense_hits = retain_project(dense_hits, &query.project_id);
                let sparse_hits = retain_project(sparse_hits, &query.project_id);
                fuse_rrf(&[dense_hits, sparse_hits], self.options.k_rrf)
            }
            _ => {
                let request = StoreSearch {
                    vector: QueryVector::Dense(dense_vector),
                    filter,
                    limit: top_k,
                };
                let hits = self.store.search(&binding.collection_name, &request).await?;
                retain_project(hits, &query.project_id)
            }
        };

        let items = ranked
            .into_iter()
            .take(top_k)
            .map(|point| self.to_hit(point, query.full_text))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            project_id = %query.project_id,
            mode = %query.mode,
            collection = %binding.collection_name,
            count = items.len(),
            "query served"
        );

        Ok(QueryResponse {
            mode: query.mode,
            count: items.len(),
            items,
        })
    }

    fn to_hit(&self, point: ScoredPoint, full_text: bool) -> Result<SearchHit, SearchError> {
        let payload: HitPayload =
            serde_json::from_value(point.payload).map_err(StoreError::Serialization)?;
        let (text, truncated) = if full_text {
            (payload.text, false)
        } else {
            trim_text(&payload.text, self.options.max_chars)
        };

        Ok(SearchHit {
            chunk_id: payload.chunk_id.unwrap_or(point.id),
            doc_id: payload.doc_id,
            project_id: payload.project_id,
            score: point.score,
            text,
            truncated,
            citekey: payload.citekey,
            title: payload.title,
            authors: payload.authors,
            year: payload.year,
            doi: payload.doi,
            url: payload.url,
            page_start: payload.page_start,
            page_end: payload.page_end,
            section_heading: payload.section_heading,
            section_path: payload.section_path,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HitPayload {
    #[serde(default)]
    project_id: String,
    #[serde(default)]
    doc_id: String,
    #[serde(default)]
    chunk_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    citekey: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    authors: Vec<String>,
    #[serde(default)]
    year: Option<i32>,
    #[serde(default)]
    doi: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    page_start: u32,
    #[serde(default)]
    page_end: u32,
    #[serde(default)]
    section_heading: Option<String>,
    #[serde(default)]
    section_path: Vec<String>,
}

fn first<T>(mut vectors: Vec<T>) -> Result<T, EmbeddingError> {
    if vectors.len() != 1 {
        return Err(EmbeddingError::CountMismatch {
            expected: 1,
            got: vectors.len(),
        });
    }
    vectors
        .pop()
        .ok_or(EmbeddingError::CountMismatch { expected: 1, got: 0 })
}

fn retain_project(hits: Vec<ScoredPoint>, project_id: &str) -> Vec<ScoredPoint> {
    let before = hits.len();
    let kept: Vec<ScoredPoint> = hits
        .into_iter()
        .filter(|hit| {
            hit.payload
                .get(FIELD_PROJECT_ID)
                .and_then(|value| value.as_str())
                == Some(project_id)
        })
        .collect();

    if kept.len() != before {
        warn!(
            project_id,
            dropped = before - kept.len(),
            "store returned hits from another project"
        );
    }
    kept
}

fn chunk_key(point: &ScoredPoint) -> String {
    point
        .payload
        .get("chunk_id")
        .and_then(|value| value.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| point.id.clone())
}

struct Fused {
    key: String,
    point: ScoredPoint,
    score: f64,
}

/// Reciprocal rank fusion: each list contributes `1 / (k_rrf + rank)` with 1-based
/// ranks. Equal scores are ordered by chunk id.
pub fn fuse_rrf(lists: &[Vec<ScoredPoint>], k_rrf: u32) -> Vec<ScoredPoint> {
    let k = f64::from(k_rrf);
    let mut fused = HashMap::<String, Fused>::new();

    for list in lists {
        for (position, hit) in list.iter().enumerate() {
            let key = chunk_key(hit);
            let entry = fused.entry(key.clone()).or_insert_with(|| Fused {
                key,
                point: hit.clone(),
                score: 0.0,
            });
            entry.score += 1.0 / (k + position as f64 + 1.0);
        }
    }

    let mut ranked: Vec<Fused> = fused.into_values().collect();
    ranked.sort_by(|left, right| {
        right
            .score
            .total_cmp(&left.score)
            .then_with(|| left.key.cmp(&right.key))
    });

    ranked
        .into_iter()
        .map(|entry| ScoredPoint {
            score: entry.score,
            ..entry.point
        })
        .collect()
}

/// Cuts `text` to at most `max_chars` characters, preferring a word boundary, and
/// appends the truncation marker.
pub fn trim_text(text: &str, max_chars: usize) -> (String, bool) {
    let Some((cut, _)) = text.char_indices().nth(max_chars) else {
        return (text.to_string(), false);
    };

    let head = &text[..cut];
    let head = if text[cut..].starts_with(char::is_whitespace) {
        head
    } else {
        match head.rfind(char::is_whitespace) {
            Some(boundary) if boundary > 0 => &head[..boundary],
            _ => head,
        }
    };

    let mut trimmed = head.trim_end().to_string();
    trimmed.push_str(TRUNCATION_MARKER);
    (trimmed, true)
}
