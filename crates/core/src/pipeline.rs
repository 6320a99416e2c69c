//! End-to-end ingestion and query entry points.
//!
//! A [`Pipeline`] owns shared handles to the converter, metadata resolver,
//! embedders, vector store and audit log. Nothing is global: tests build one
//! around fakes, the CLI builds one from [`PipelineConfig`].

use crate::audit::{AuditLog, AuditOutcome, AuditRecord, JsonlAuditLog, NullAuditLog};
use crate::chunking::Chunker;
use crate::collections::{CollectionManager, ModelSpec};
use crate::config::{ConverterBackend, EmbeddingProvider, PipelineConfig};
use crate::converter::{HttpConverter, HttpConverterConfig, LopdfConverter};
use crate::embeddings::{
    CharacterNgramEmbedder, Embedder, HashedTermEmbedder, HttpEmbedder, HttpEmbedderConfig,
    SparseEmbedder,
};
use crate::error::{EmbeddingError, IngestError, SearchError, StoreError};
use crate::indexer::{EmbeddedChunk, Indexer};
use crate::ingest::{BatchReport, FailedDocument};
use crate::models::{
    Chunk, CitationMeta, CollectionBinding, DocumentSource, IngestReport, QueryResponse,
    SearchQuery,
};
use crate::orchestrator::{ConversionOrchestrator, ConvertedDocument};
use crate::retrieval::RetrievalEngine;
use crate::store::{PointFilter, SparseVector};
use crate::stores::QdrantStore;
use crate::traits::{Converter, MetadataLookup, MetadataResolver, VectorStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

const EMBED_BATCH: usize = 64;

/// External collaborators of a pipeline.
pub struct PipelineHandles {
    pub converter: Arc<dyn Converter>,
    pub metadata: Arc<dyn MetadataResolver>,
    pub store: Arc<dyn VectorStore>,
    pub dense: Arc<dyn Embedder>,
    pub sparse: Option<Arc<dyn SparseEmbedder>>,
    pub audit: Arc<dyn AuditLog>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectStatus {
    pub binding: CollectionBinding,
    pub points: u64,
}

pub struct Pipeline {
    orchestrator: ConversionOrchestrator,
    metadata: Arc<dyn MetadataResolver>,
    chunker: Chunker,
    store: Arc<dyn VectorStore>,
    dense: Arc<dyn Embedder>,
    sparse: Option<Arc<dyn SparseEmbedder>>,
    indexer: Indexer,
    retrieval: RetrievalEngine,
    audit: Arc<dyn AuditLog>,
    migrate: bool,
}

impl Pipeline {
    /// Fails when the chunking tokenizer and the dense model disagree on how to count
    /// tokens, since chunk sizes would then be meaningless.
    pub fn new(config: &PipelineConfig, handles: PipelineHandles) -> Result<Self, IngestError> {
        let chunker = Chunker::new(config.chunking.clone())?;
        chunker.ensure_aligned(handles.dense.model_id(), handles.dense.tokenizer_family())?;

        let collections = Arc::new(CollectionManager::new(
            Arc::clone(&handles.store),
            config.collection.prefix.clone(),
        ));
        let indexer = Indexer::new(
            Arc::clone(&handles.store),
            Arc::clone(&collections),
            config.indexer.options(config.collection.on_disk),
        );
        let retrieval = RetrievalEngine::new(
            Arc::clone(&handles.store),
            collections,
            Arc::clone(&handles.dense),
            handles.sparse.clone(),
            config.retrieval.options(),
        );
        let orchestrator = ConversionOrchestrator::new(
            handles.converter,
            config.windowing,
            config.conversion.options(),
        );

        Ok(Self {
            orchestrator,
            metadata: handles.metadata,
            chunker,
            store: handles.store,
            dense: handles.dense,
            sparse: handles.sparse,
            indexer,
            retrieval,
            audit: handles.audit,
            migrate: false,
        })
    }

    /// Builds the production handles described by `config`: lopdf or HTTP conversion,
    /// n-gram or HTTP embeddings, and Qdrant storage.
    pub fn from_config(
        config: &PipelineConfig,
        metadata: Arc<dyn MetadataResolver>,
    ) -> Result<Self, IngestError> {
        let converter: Arc<dyn Converter> = match config.conversion.backend {
            ConverterBackend::Lopdf => Arc::new(LopdfConverter::new().map_err(|error| {
                IngestError::InvalidArgument(format!("heading pattern: {error}"))
            })?),
            ConverterBackend::Http => {
                let endpoint = config.conversion.endpoint.clone().ok_or_else(|| {
                    IngestError::InvalidArgument("conversion.endpoint is not set".to_string())
                })?;
                let converter = HttpConverter::new(HttpConverterConfig {
                    endpoint,
                    api_key: config.conversion.api_key.clone(),
                    timeout: config.conversion.window_timeout_secs,
                })
                .map_err(|error| IngestError::InvalidArgument(error.to_string()))?;
                Arc::new(converter)
            }
        };

        let embedding = &config.embedding;
        let dense: Arc<dyn Embedder> = match embedding.provider {
            EmbeddingProvider::Ngram => Arc::new(CharacterNgramEmbedder::new(embedding.dimensions)),
            EmbeddingProvider::Http => Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
                endpoint: embedding.endpoint.clone().unwrap_or_default(),
                model: embedding.model.clone().unwrap_or_default(),
                api_key: embedding.api_key.clone(),
                dimensions: embedding.dimensions,
                tokenizer_family: embedding.tokenizer_family.clone(),
                timeout: embedding.timeout_secs,
                max_retries: embedding.max_retries,
            })?),
        };

        let sparse: Option<Arc<dyn SparseEmbedder>> = if embedding.sparse {
            let embedder = HashedTermEmbedder::new()
                .map_err(|error| IngestError::InvalidArgument(format!("term pattern: {error}")))?;
            Some(Arc::new(embedder))
        } else {
            None
        };

        let store: Arc<dyn VectorStore> = Arc::new(QdrantStore::new(
            &config.qdrant.url,
            &config.collection.prefix,
            config.qdrant.api_key.as_deref(),
            config.qdrant.timeout_secs,
        )?);

        let audit: Arc<dyn AuditLog> = match &config.audit.path {
            Some(path) => Arc::new(JsonlAuditLog::new(path.clone())),
            None => Arc::new(NullAuditLog),
        };

        Self::new(
            config,
            PipelineHandles {
                converter,
                metadata,
                store,
                dense,
                sparse,
                audit,
            },
        )
    }

    /// Lets ingestion move a project onto a new collection when its embedding models
    /// changed, instead of refusing the write.
    pub fn allow_migration(mut self, migrate: bool) -> Self {
        self.migrate = migrate;
        self
    }

    pub fn models(&self) -> ModelSpec {
        ModelSpec {
            dense_model_id: self.dense.model_id().to_string(),
            dense_dimensions: self.dense.dimensions(),
            sparse_model_id: self.sparse.as_ref().map(|sparse| sparse.model_id().to_string()),
        }
    }

    /// Converts, chunks, embeds and indexes one document. Missing metadata, failed
    /// windows and filtered chunks degrade the report; model mismatches and store
    /// exhaustion are errors.
    pub async fn ingest(
        &self,
        project_id: &str,
        source: &DocumentSource,
    ) -> Result<IngestReport, IngestError> {
        let correlation_id = Uuid::new_v4().to_string();
        let span = info_span!(
            "ingest",
            correlation_id = %correlation_id,
            project_id,
            doc_id = %source.doc_id
        );

        async {
            let started = Instant::now();
            let mut report = IngestReport {
                correlation_id: correlation_id.clone(),
                doc_id: source.doc_id.clone(),
                project_id: project_id.to_string(),
                ..IngestReport::default()
            };
            let mut trail = Trail::default();

            let result = self.run_ingest(project_id, source, &mut report, &mut trail).await;

            let (outcome, error) = match &result {
                Ok(()) if report.warnings.is_empty() => (AuditOutcome::Completed, None),
                Ok(()) => (AuditOutcome::Degraded, None),
                Err(error) => (AuditOutcome::Failed, Some(error.to_string())),
            };
            let models = self.models();
            let record = AuditRecord {
                correlation_id: correlation_id.clone(),
                recorded_at: Utc::now(),
                project_id: project_id.to_string(),
                doc_id: source.doc_id.clone(),
                source_path: source.path.display().to_string(),
                collection: trail.collection,
                dense_model: models.dense_model_id,
                sparse_model: models.sparse_model_id,
                windows: trail.windows,
                gaps: trail.gaps,
                chunks_written: committed_count(&result, report.chunks_written),
                chunks_filtered: report.chunks_filtered,
                warnings: report.warnings.clone(),
                outcome,
                error,
                duration_seconds: started.elapsed().as_secs_f64(),
            };
            if let Err(error) = self.audit.record(&record).await {
                warn!(%error, "audit record not written");
            }

            result.map(|()| report)
        }
        .instrument(span)
        .await
    }

    async fn run_ingest(
        &self,
        project_id: &str,
        source: &DocumentSource,
        report: &mut IngestReport,
        trail: &mut Trail,
    ) -> Result<(), IngestError> {
        if project_id.trim().is_empty() {
            return Err(IngestError::InvalidArgument("project id is empty".to_string()));
        }

        let models = self.models();
        // Refuse mismatched models before spending time on conversion.
        let binding = self.indexer.prepare(project_id, &models, self.migrate).await?;
        trail.collection = Some(binding.collection_name.clone());

        let citation = self.resolve_citation(source, &mut report.warnings).await;

        let ConvertedDocument {
            result: document,
            windows,
            warnings,
        } = self.orchestrator.convert_document(source).await;
        trail.windows = windows;
        trail.gaps = document.gaps.len();
        report.warnings.extend(warnings);

        if document.is_empty() {
            report
                .warnings
                .push(format!("no text extracted from {}", source.path.display()));
            warn!(path = %source.path.display(), "document produced no text");
            return Ok(());
        }

        let outcome = self.chunker.chunk(&document, &models.dense_model_id);
        report.chunks_filtered = outcome.filtered;
        if outcome.filtered > 0 {
            report.warnings.push(format!(
                "{} chunk(s) dropped below the length or signal-to-noise threshold",
                outcome.filtered
            ));
        }

        let mut chunks = outcome.chunks;
        for chunk in &mut chunks {
            chunk.citation = Some(citation.clone());
        }

        let items = self.embed_chunks(chunks).await?;
        let indexed = self
            .indexer
            .upsert(project_id, &items, &models, self.migrate)
            .await?;
        report.chunks_written = indexed.written;

        info!(
            collection = %indexed.binding.collection_name,
            chunks_written = report.chunks_written,
            chunks_filtered = report.chunks_filtered,
            warnings = report.warnings.len(),
            "document ingested"
        );
        Ok(())
    }

    async fn resolve_citation(
        &self,
        source: &DocumentSource,
        warnings: &mut Vec<String>,
    ) -> CitationMeta {
        let lookup = self
            .metadata
            .resolve(source.citekey.as_deref(), &source.doc_id, &source.title_hint)
            .await;

        match lookup {
            MetadataLookup::Found(meta) => meta,
            MetadataLookup::Missing => {
                let label = source.citekey.as_deref().unwrap_or(&source.title_hint);
                warnings.push(format!("no citation metadata found for `{label}`"));
                warn!(citekey = ?source.citekey, hint = %source.title_hint, "metadata missing");
                CitationMeta {
                    citekey: source.citekey.clone().unwrap_or_default(),
                    title: Some(source.title_hint.clone()),
                    ..CitationMeta::default()
                }
            }
        }
    }

    async fn embed_chunks(
        &self,
        chunks: Vec<Chunk>,
    ) -> Result<Vec<EmbeddedChunk>, IngestError> {
        let mut items = Vec::with_capacity(chunks.len());

        for batch in chunks.chunks(EMBED_BATCH) {
            let texts: Vec<String> = batch.iter().map(|chunk| chunk.embedding_text()).collect();

            let dense = self.dense.embed(&texts).await?;
            check_count(texts.len(), dense.len())?;
            if let Some(vector) = dense.iter().find(|vector| vector.len() != self.dense.dimensions()) {
                return Err(EmbeddingError::DimensionMismatch {
                    expected: self.dense.dimensions(),
                    got: vector.len(),
                }
                .into());
            }

            let sparse: Vec<Option<SparseVector>> = match &self.sparse {
                Some(embedder) => {
                    let vectors = embedder.embed_sparse(&texts).await?;
                    check_count(texts.len(), vectors.len())?;
                    vectors.into_iter().map(Some).collect()
                }
                None => vec![None; texts.len()],
            };

            items.extend(batch.iter().cloned().zip(dense).zip(sparse).map(
                |((chunk, dense), sparse)| EmbeddedChunk {
                    chunk,
                    dense,
                    sparse,
                },
            ));
        }

        Ok(items)
    }

    /// Ingests each source in turn; a failing document is recorded and the batch
    /// moves on.
    pub async fn ingest_batch(&self, project_id: &str, sources: &[DocumentSource]) -> BatchReport {
        let mut batch = BatchReport::default();

        for source in sources {
            match self.ingest(project_id, source).await {
                Ok(report) => batch.reports.push(report),
                Err(error) => {
                    warn!(path = %source.path.display(), %error, "document failed");
                    batch.failures.push(FailedDocument {
                        path: source.path.clone(),
                        doc_id: Some(source.doc_id.clone()),
                        reason: error.to_string(),
                    });
                }
            }
        }

        info!(
            project_id,
            documents = batch.reports.len(),
            failures = batch.failures.len(),
            chunks = batch.chunks_written(),
            "batch finished"
        );
        batch
    }

    pub async fn query(&self, query: &SearchQuery) -> Result<QueryResponse, SearchError> {
        self.retrieval.search(query).await
    }

    /// The project's binding and how many points it holds, or `None` if unbound.
    pub async fn describe(&self, project_id: &str) -> Result<Option<ProjectStatus>, StoreError> {
        let Some(binding) = self.store.load_binding(project_id).await? else {
            return Ok(None);
        };
        let points = self
            .store
            .count(&binding.collection_name, &PointFilter::for_project(project_id))
            .await?;
        Ok(Some(ProjectStatus { binding, points }))
    }
}

#[derive(Debug, Default)]
struct Trail {
    collection: Option<String>,
    windows: usize,
    gaps: usize,
}

fn committed_count(result: &Result<(), IngestError>, written: usize) -> usize {
    match result {
        Err(IngestError::StoreExhausted { committed, .. }) => *committed,
        _ => written,
    }
}

fn check_count(expected: usize, got: usize) -> Result<(), EmbeddingError> {
    if expected == got {
        Ok(())
    } else {
        Err(EmbeddingError::CountMismatch { expected, got })
    }
}
