use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A document handed to the pipeline. `doc_id` is derived from the content checksum,
/// so the same bytes always map to the same id regardless of where they live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentSource {
    pub doc_id: String,
    pub path: PathBuf,
    pub title_hint: String,
    pub citekey: Option<String>,
    pub checksum: String,
}

/// Inclusive, 1-based page range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageRange {
    pub start: u32,
    pub end: u32,
}

impl PageRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, page: u32) -> bool {
        page >= self.start && page <= self.end
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConversionWindow {
    pub doc_id: String,
    pub window_index: usize,
    /// `None` is the unbounded window used when the page count is unknown.
    pub page_range: Option<PageRange>,
}

/// Offsets are UTF-8 byte offsets into the owning text and always fall on char boundaries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PageMapEntry {
    pub page_number: u32,
    pub start_offset: usize,
    pub end_offset: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeadingNode {
    pub level: u8,
    pub title: String,
    pub page_anchor: u32,
    pub offset: usize,
    #[serde(default)]
    pub children: Vec<HeadingNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowGap {
    pub window_index: usize,
    pub page_range: Option<PageRange>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConversionResult {
    pub doc_id: String,
    pub plain_text: String,
    pub page_map: Vec<PageMapEntry>,
    pub heading_tree: Vec<HeadingNode>,
    pub gaps: Vec<WindowGap>,
}

impl ConversionResult {
    pub fn is_empty(&self) -> bool {
        self.plain_text.trim().is_empty()
    }

    pub fn page_map_is_monotonic(&self) -> bool {
        self.page_map.iter().all(|entry| entry.start_offset <= entry.end_offset)
            && self
                .page_map
                .windows(2)
                .all(|pair| pair[0].end_offset <= pair[1].start_offset)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingPolicy {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
    pub heading_context: u8,
    pub tokenizer_id: String,
    pub min_chunk_length: usize,
    pub min_signal_to_noise: f32,
}

impl Default for ChunkingPolicy {
    fn default() -> Self {
        Self {
            max_tokens: 450,
            overlap_tokens: 60,
            heading_context: 1,
            tokenizer_id: "word".to_string(),
            min_chunk_length: 50,
            min_signal_to_noise: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PageSpan {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub text: String,
    pub context_prefix: Option<String>,
    pub page_span: PageSpan,
    pub section_heading: Option<String>,
    pub section_path: Vec<String>,
    pub chunk_idx: u64,
    pub token_count: usize,
    pub signal_to_noise: f32,
    #[serde(default)]
    pub citation: Option<CitationMeta>,
}

impl Chunk {
    /// Text sent to the embedder: heading context first, then the body.
    pub fn embedding_text(&self) -> String {
        match &self.context_prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}\n\n{}", self.text),
            _ => self.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CitationMeta {
    pub citekey: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub authors: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub doi: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub collections: Vec<String>,
}

/// The embedding models a project's collection is bound to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollectionBinding {
    pub project_id: String,
    pub collection_name: String,
    pub dense_model_id: String,
    pub dense_dimensions: usize,
    pub sparse_model_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub previous_collections: Vec<String>,
}

impl CollectionBinding {
    pub fn matches(&self, dense_model_id: &str, sparse_model_id: Option<&str>) -> bool {
        self.dense_model_id == dense_model_id && self.sparse_model_id.as_deref() == sparse_model_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    #[default]
    Dense,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dense" => Ok(SearchMode::Dense),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => Err(format!("unknown search mode `{other}`, use dense or hybrid")),
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Dense => f.write_str("dense"),
            SearchMode::Hybrid => f.write_str("hybrid"),
        }
    }
}

/// Caller-supplied narrowing. The project scope is not part of this struct and
/// cannot be widened from here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub struct QueryFilters {
    #[serde(default)]
    pub doc_ids: Vec<String>,
    #[serde(default)]
    pub citekey: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SearchQuery {
    pub project_id: String,
    pub text: String,
    pub top_k: usize,
    pub filters: QueryFilters,
    pub mode: SearchMode,
    pub full_text: bool,
}

impl SearchQuery {
    pub fn new(project_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            text: text.into(),
            top_k: 6,
            filters: QueryFilters::default(),
            mode: SearchMode::Dense,
            full_text: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub doc_id: String,
    pub project_id: String,
    pub score: f64,
    pub text: String,
    pub truncated: bool,
    pub citekey: Option<String>,
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub year: Option<i32>,
    pub doi: Option<String>,
    pub url: Option<String>,
    pub page_start: u32,
    pub page_end: u32,
    pub section_heading: Option<String>,
    pub section_path: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub mode: SearchMode,
    pub count: usize,
    pub items: Vec<SearchHit>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestReport {
    pub correlation_id: String,
    pub doc_id: String,
    pub project_id: String,
    pub chunks_written: usize,
    pub chunks_filtered: usize,
    pub warnings: Vec<String>,
}
