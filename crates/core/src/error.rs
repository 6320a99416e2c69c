use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("converter returned {status}: {details}")]
    BackendResponse { status: u16, details: String },

    #[error("converter response was unusable: {0}")]
    InvalidResponse(String),

    #[error("conversion timed out after {0:?}")]
    Timeout(Duration),
}

impl ConversionError {
    /// The source itself cannot be read; converting it again will not help.
    pub fn is_unreadable(&self) -> bool {
        matches!(self, ConversionError::Io(_) | ConversionError::PdfParse(_))
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend} ({status}): {details}")]
    BackendResponse {
        backend: String,
        status: u16,
        details: String,
    },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store request failed: {0}")]
    Request(String),
}

impl StoreError {
    /// Connectivity problems, throttling and server-side failures are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(error) => {
                error.is_connect() || error.is_timeout() || error.is_request() || error.is_body()
            }
            StoreError::BackendResponse { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedding provider returned {status}: {details}")]
    BackendResponse { status: u16, details: String },

    #[error("embedding provider returned {got} vectors for {expected} inputs")]
    CountMismatch { expected: usize, got: usize },

    #[error("embedding dimension {got} does not match expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding request failed: {0}")]
    Request(String),
}

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error(
        "collection `{collection}` for project `{project_id}` is bound to dense={bound_dense} sparse={bound_sparse:?}, requested dense={requested_dense} sparse={requested_sparse:?}"
    )]
    EmbeddingModelMismatch {
        project_id: String,
        collection: String,
        bound_dense: String,
        bound_sparse: Option<String>,
        requested_dense: String,
        requested_sparse: Option<String>,
    },

    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("hybrid search needs a sparse model bound to project `{0}`")]
    HybridNotSupported(String),

    #[error("collection `{collection}` is missing required index `{index}`")]
    IndexUnavailable { collection: String, index: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("tokenizer `{tokenizer}` (family {tokenizer_family}) does not match embedding model `{model_id}` (family {model_family})")]
    TokenizerMismatch {
        tokenizer: String,
        tokenizer_family: String,
        model_id: String,
        model_family: String,
    },

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("store unavailable after retries, {committed} items committed: {source}")]
    StoreExhausted {
        committed: usize,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("audit log write failed: {0}")]
    Audit(String),
}

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("search request failed: {0}")]
    Request(String),

    #[error(transparent)]
    Collection(#[from] CollectionError),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("search timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
