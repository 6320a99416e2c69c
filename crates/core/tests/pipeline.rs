use async_trait::async_trait;
use docshelf_core::{
    CharacterNgramEmbedder, ChunkingPolicy, CollectionError, ConversionError, Converter,
    ConvertedWindow, DocumentSource, HashedTermEmbedder, IngestError, JsonMetadataResolver,
    JsonlAuditLog, MemoryStore, MetadataResolver, NoMetadata, NullAuditLog, PageMapEntry,
    PageRange, Pipeline, PipelineConfig, PipelineHandles, SearchMode, SearchQuery,
    SparseEmbedder, VectorStore,
};
use std::path::PathBuf;
use std::sync::Arc;

/// Serves fixed page texts; windows starting at a page in `failing` error out.
struct PagedConverter {
    pages: Vec<String>,
    failing: Vec<u32>,
}

impl PagedConverter {
    fn new(pages: Vec<String>) -> Self {
        Self {
            pages,
            failing: Vec::new(),
        }
    }
}

#[async_trait]
impl Converter for PagedConverter {
    async fn convert(
        &self,
        _source: &DocumentSource,
        pages: Option<PageRange>,
    ) -> Result<ConvertedWindow, ConversionError> {
        let range = pages.unwrap_or(PageRange::new(1, self.pages.len() as u32));
        if self.failing.contains(&range.start) {
            return Err(ConversionError::InvalidResponse(format!(
                "pages {range} unreadable"
            )));
        }

        let mut window = ConvertedWindow::default();
        for page_number in range.start..=range.end {
            let Some(text) = self.pages.get(page_number as usize - 1) else {
                break;
            };
            if !window.plain_text.is_empty() {
                window.plain_text.push_str("\n\n");
            }
            let start_offset = window.plain_text.len();
            window.plain_text.push_str(text);
            window.page_map.push(PageMapEntry {
                page_number,
                start_offset,
                end_offset: window.plain_text.len(),
            });
        }
        Ok(window)
    }

    async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
        Ok(Some(self.pages.len() as u32))
    }
}

/// `count` distinct plain words, each one token.
fn words(prefix: &str, count: usize) -> String {
    (0..count)
        .map(|index| format!("{prefix}{index}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn source(doc_id: &str, citekey: Option<&str>) -> DocumentSource {
    DocumentSource {
        doc_id: doc_id.to_string(),
        path: PathBuf::from(format!("/papers/{doc_id}.pdf")),
        title_hint: doc_id.to_string(),
        citekey: citekey.map(str::to_string),
        checksum: format!("{doc_id}-checksum"),
    }
}

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.chunking = ChunkingPolicy {
        max_tokens: 60,
        overlap_tokens: 0,
        min_chunk_length: 10,
        ..ChunkingPolicy::default()
    };
    config.conversion.retry_delays_ms = Vec::new();
    config
}

struct Harness {
    store: Arc<MemoryStore>,
    config: PipelineConfig,
    dense_dimensions: usize,
    sparse: bool,
    metadata: Arc<dyn MetadataResolver>,
}

impl Harness {
    fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            config: config(),
            dense_dimensions: 32,
            sparse: false,
            metadata: Arc::new(NoMetadata),
        }
    }

    fn build(&self, converter: PagedConverter) -> Pipeline {
        let store: Arc<dyn VectorStore> = self.store.clone();
        let sparse: Option<Arc<dyn SparseEmbedder>> = if self.sparse {
            Some(Arc::new(HashedTermEmbedder::new().expect("valid regex")))
        } else {
            None
        };
        Pipeline::new(
            &self.config,
            PipelineHandles {
                converter: Arc::new(converter),
                metadata: Arc::clone(&self.metadata),
                store,
                dense: Arc::new(CharacterNgramEmbedder::new(self.dense_dimensions)),
                sparse,
                audit: Arc::new(NullAuditLog),
            },
        )
        .expect("pipeline builds")
    }
}

#[tokio::test]
async fn reingesting_a_document_keeps_exactly_its_chunks() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Harness::new(store.clone()).build(PagedConverter::new(vec![words("w", 600)]));

    let first = pipeline.ingest("p1", &source("doc-a", None)).await.expect("first ingest");
    let second = pipeline.ingest("p1", &source("doc-a", None)).await.expect("second ingest");

    assert_eq!(first.chunks_written, 10);
    assert_eq!(second.chunks_written, 10);
    assert_eq!(store.point_count("shelf_p1"), 10);
    assert_ne!(first.correlation_id, second.correlation_id);
}

#[tokio::test]
async fn identical_input_produces_identical_chunk_ids() {
    let mut ids = Vec::new();
    for _ in 0..2 {
        let store = Arc::new(MemoryStore::new());
        let pipeline =
            Harness::new(store).build(PagedConverter::new(vec![words("w", 180)]));
        pipeline.ingest("p1", &source("doc-a", None)).await.expect("ingest");

        let mut query = SearchQuery::new("p1", "w1 w2 w3");
        query.full_text = true;
        let mut found: Vec<String> = pipeline
            .query(&query)
            .await
            .expect("query")
            .items
            .into_iter()
            .map(|hit| hit.chunk_id)
            .collect();
        found.sort();
        ids.push(found);
    }

    assert_eq!(ids[0].len(), 3);
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn different_embedding_model_is_refused_without_migration() {
    let store = Arc::new(MemoryStore::new());
    let pages = vec![words("w", 120)];

    let harness_a = Harness::new(store.clone());
    harness_a
        .build(PagedConverter::new(pages.clone()))
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("model A ingest");

    let mut harness_b = Harness::new(store.clone());
    harness_b.dense_dimensions = 48;
    let result = harness_b
        .build(PagedConverter::new(pages.clone()))
        .ingest("p1", &source("doc-b", None))
        .await;

    assert!(matches!(
        result,
        Err(IngestError::Collection(CollectionError::EmbeddingModelMismatch { ref bound_dense, ref requested_dense, .. }))
            if bound_dense == "char-ngram-32" && requested_dense == "char-ngram-48"
    ));
    assert_eq!(store.point_count("shelf_p1"), 2);
}

#[tokio::test]
async fn migration_moves_project_to_a_new_collection() {
    let store = Arc::new(MemoryStore::new());
    let pages = vec![words("w", 120)];

    Harness::new(store.clone())
        .build(PagedConverter::new(pages.clone()))
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("model A ingest");

    let mut harness_b = Harness::new(store.clone());
    harness_b.dense_dimensions = 48;
    let pipeline_b = harness_b
        .build(PagedConverter::new(pages))
        .allow_migration(true);
    let report = pipeline_b
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("migrating ingest");

    assert_eq!(report.chunks_written, 2);
    assert_eq!(store.collection_names().len(), 2);
    assert_eq!(store.point_count("shelf_p1"), 2);

    let status = pipeline_b.describe("p1").await.expect("describe").expect("bound");
    assert_eq!(status.binding.dense_model_id, "char-ngram-48");
    assert_eq!(status.binding.previous_collections, vec!["shelf_p1".to_string()]);
    assert_eq!(status.points, 2);
}

#[tokio::test]
async fn query_returns_trimmed_cited_results_for_a_small_project() {
    let store = Arc::new(MemoryStore::new());
    let mut harness = Harness::new(store);
    harness.config.retrieval.max_chars = 100;
    harness.metadata = Arc::new(
        JsonMetadataResolver::from_json(
            r#"[{
                "citekey": "okafor2022",
                "title": "Carbon in Grassland Soils",
                "authors": ["Okafor, A."],
                "year": 2022,
                "doi": "10.1000/grass.2022",
                "tags": ["soil"]
            }]"#,
        )
        .expect("library parses"),
    );

    let pipeline = harness.build(PagedConverter::new(vec![
        words("alpha", 60),
        words("beta", 60),
        words("gamma", 60),
    ]));
    let report = pipeline
        .ingest("p1", &source("doc-a", Some("okafor2022")))
        .await
        .expect("ingest");
    assert_eq!(report.chunks_written, 3);
    assert!(report.warnings.is_empty());

    let mut query = SearchQuery::new("p1", "beta12 beta13");
    query.top_k = 6;
    let response = pipeline.query(&query).await.expect("query");

    assert_eq!(response.count, 3);
    assert_eq!(response.mode, SearchMode::Dense);
    for hit in &response.items {
        assert_eq!(hit.project_id, "p1");
        assert!(hit.truncated);
        assert!(hit.text.ends_with(" …"));
        assert!(hit.text.chars().count() <= 102);
        assert_eq!(hit.citekey.as_deref(), Some("okafor2022"));
        assert_eq!(hit.title.as_deref(), Some("Carbon in Grassland Soils"));
        assert_eq!(hit.year, Some(2022));
        assert!(hit.page_start >= 1 && hit.page_end >= hit.page_start);
    }
}

#[tokio::test]
async fn noisy_chunks_are_filtered_and_counted() {
    let store = Arc::new(MemoryStore::new());
    let noise = vec!["a@@@@@@@@@"; 6].join(" ");
    let page = format!("{} {noise}", words("w", 60));

    let report = Harness::new(store.clone())
        .build(PagedConverter::new(vec![page]))
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("ingest");

    assert_eq!(report.chunks_written, 1);
    assert_eq!(report.chunks_filtered, 1);
    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.contains("signal-to-noise")));
    assert_eq!(store.point_count("shelf_p1"), 1);
}

#[tokio::test]
async fn failed_window_becomes_a_gap_and_the_rest_is_indexed() {
    let store = Arc::new(MemoryStore::new());
    let mut harness = Harness::new(store.clone());
    harness.config.windowing.force_windowed = true;

    let pages: Vec<String> = (0..30).map(|page| words(&format!("p{page}x"), 20)).collect();
    let mut converter = PagedConverter::new(pages);
    converter.failing = vec![11];

    let report = harness
        .build(converter)
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("ingest degrades instead of failing");

    assert!(report.warnings.iter().any(|warning| warning.contains("11-20")));
    // 20 surviving pages of 20 tokens each, 60 tokens per chunk
    assert!(report.chunks_written >= 6);
    assert_eq!(store.point_count("shelf_p1"), report.chunks_written);
}

#[tokio::test]
async fn document_with_every_window_failing_yields_no_chunks() {
    let store = Arc::new(MemoryStore::new());
    let mut harness = Harness::new(store.clone());
    harness.config.windowing.force_windowed = true;

    let mut converter = PagedConverter::new((0..20).map(|_| words("w", 20)).collect());
    converter.failing = vec![1, 11];

    let report = harness
        .build(converter)
        .ingest("p1", &source("doc-a", None))
        .await
        .expect("ingest reports instead of failing");

    assert_eq!(report.chunks_written, 0);
    assert!(!report.warnings.is_empty());
    assert_eq!(store.point_count("shelf_p1"), 0);
}

#[tokio::test]
async fn projects_never_see_each_others_chunks() {
    let store = Arc::new(MemoryStore::new());
    let harness = Harness::new(store);

    harness
        .build(PagedConverter::new(vec![words("shared", 120)]))
        .ingest("p1", &source("doc-one", None))
        .await
        .expect("p1 ingest");
    let pipeline = harness.build(PagedConverter::new(vec![words("shared", 120)]));
    pipeline
        .ingest("p2", &source("doc-two", None))
        .await
        .expect("p2 ingest");

    let response = pipeline
        .query(&SearchQuery::new("p1", "shared1 shared2"))
        .await
        .expect("query");

    assert!(response.count > 0);
    assert!(response
        .items
        .iter()
        .all(|hit| hit.project_id == "p1" && hit.doc_id == "doc-one"));
}

#[tokio::test]
async fn hybrid_queries_need_a_sparse_binding() {
    let store = Arc::new(MemoryStore::new());
    let pages = vec![words("delta", 120)];

    let dense_only = Harness::new(store.clone());
    let pipeline = dense_only.build(PagedConverter::new(pages.clone()));
    pipeline.ingest("dense", &source("doc-a", None)).await.expect("ingest");

    let mut hybrid_query = SearchQuery::new("dense", "delta3");
    hybrid_query.mode = SearchMode::Hybrid;
    assert!(pipeline.query(&hybrid_query).await.is_err());

    let mut with_sparse = Harness::new(store);
    with_sparse.sparse = true;
    let pipeline = with_sparse.build(PagedConverter::new(pages));
    pipeline.ingest("hybrid", &source("doc-a", None)).await.expect("ingest");

    hybrid_query.project_id = "hybrid".to_string();
    let response = pipeline.query(&hybrid_query).await.expect("hybrid query");
    assert_eq!(response.mode, SearchMode::Hybrid);
    assert_eq!(response.count, 2);
}

#[tokio::test]
async fn batch_ingest_records_failures_and_continues() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(MemoryStore::new());
    let pipeline = Harness::new(store).build(PagedConverter::new(vec![words("w", 60)]));

    let sources = vec![source("doc-a", None), source("doc-b", None)];
    let blank = pipeline.ingest_batch("  ", &sources).await;
    assert_eq!(blank.failures.len(), 2);

    let batch = pipeline.ingest_batch("p1", &sources).await;
    assert!(batch.failures.is_empty());
    assert_eq!(batch.reports.len(), 2);
    assert_eq!(batch.chunks_written(), 2);
    Ok(())
}

#[tokio::test]
async fn ingest_appends_an_audit_line() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let audit_path = dir.path().join("audit.jsonl");
    let store: Arc<dyn VectorStore> = Arc::new(MemoryStore::new());

    let pipeline = Pipeline::new(
        &config(),
        PipelineHandles {
            converter: Arc::new(PagedConverter::new(vec![words("w", 60)])),
            metadata: Arc::new(NoMetadata),
            store,
            dense: Arc::new(CharacterNgramEmbedder::new(32)),
            sparse: None,
            audit: Arc::new(JsonlAuditLog::new(audit_path.clone())),
        },
    )?;
    let report = pipeline.ingest("p1", &source("doc-a", None)).await?;

    let raw = std::fs::read_to_string(&audit_path)?;
    let record: serde_json::Value = serde_json::from_str(raw.trim())?;
    assert_eq!(record["correlation_id"], report.correlation_id.as_str());
    assert_eq!(record["outcome"], "degraded");
    assert_eq!(record["chunks_written"], 1);
    let seconds = record["duration_seconds"].as_f64().ok_or("duration_seconds missing")?;
    assert!(seconds >= 0.0);
    assert!(record.get("duration_ms").is_none());
    Ok(())
}
