pub mod audit;
pub mod chunking;
pub mod collections;
pub mod config;
pub mod converter;
pub mod embeddings;
pub mod error;
pub mod indexer;
pub mod ingest;
pub mod metadata;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod retrieval;
pub mod store;
pub mod stores;
pub mod tokenizer;
pub mod traits;
pub mod windows;

pub use audit::{AuditLog, AuditOutcome, AuditRecord, JsonlAuditLog, NullAuditLog};
pub use chunking::{make_chunk_id, normalize_whitespace, signal_to_noise, Chunker, ChunkingOutcome};
pub use collections::{CollectionManager, ModelSpec};
pub use config::PipelineConfig;
pub use converter::{HttpConverter, HttpConverterConfig, LopdfConverter};
pub use embeddings::{
    CharacterNgramEmbedder, Embedder, HashedTermEmbedder, HttpEmbedder, HttpEmbedderConfig,
    SparseEmbedder, DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{
    CollectionError, ConfigError, ConversionError, EmbeddingError, IngestError, SearchError,
    StoreError,
};
pub use indexer::{EmbeddedChunk, Indexer, IndexerOptions, RetryPolicy};
pub use ingest::{
    collect_sources, digest_file, discover_pdf_files, document_source, BatchReport,
    FailedDocument,
};
pub use metadata::{JsonMetadataResolver, NoMetadata};
pub use models::{
    Chunk, ChunkingPolicy, CitationMeta, CollectionBinding, ConversionResult, ConversionWindow,
    DocumentSource, HeadingNode, IngestReport, PageMapEntry, PageRange, PageSpan, QueryFilters,
    QueryResponse, SearchHit, SearchMode, SearchQuery, WindowGap,
};
pub use orchestrator::{ConversionOptions, ConversionOrchestrator, ConvertedDocument, WindowOutcome};
pub use pipeline::{Pipeline, PipelineHandles, ProjectStatus};
pub use retrieval::{fuse_rrf, trim_text, RetrievalEngine, RetrievalOptions};
pub use store::{OnDiskFlags, SparseVector};
pub use stores::{MemoryStore, QdrantStore};
pub use traits::{Converter, ConvertedWindow, MetadataLookup, MetadataResolver, VectorStore};
pub use windows::{plan_windows, WindowingOptions};
