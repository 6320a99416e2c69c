use crate::error::{ConversionError, StoreError};
use crate::models::{CitationMeta, CollectionBinding, DocumentSource, HeadingNode, PageMapEntry, PageRange};
use crate::store::{
    CollectionDescriptor, CollectionSchema, FieldIndexKind, Point, PointFilter, ScoredPoint,
    StoreSearch,
};
use async_trait::async_trait;

/// Output of one converter call. Offsets are relative to `plain_text`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConvertedWindow {
    pub plain_text: String,
    pub page_map: Vec<PageMapEntry>,
    pub heading_tree: Vec<HeadingNode>,
}

#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(
        &self,
        source: &DocumentSource,
        pages: Option<PageRange>,
    ) -> Result<ConvertedWindow, ConversionError>;

    async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataLookup {
    Found(CitationMeta),
    Missing,
}

#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn resolve(&self, citekey: Option<&str>, doc_id: &str, hint: &str) -> MetadataLookup;
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionDescriptor>, StoreError>;

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError>;

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        kind: FieldIndexKind,
    ) -> Result<(), StoreError>;

    async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<(), StoreError>;

    async fn search(
        &self,
        collection: &str,
        request: &StoreSearch,
    ) -> Result<Vec<ScoredPoint>, StoreError>;

    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<u64, StoreError>;

    async fn load_binding(&self, project_id: &str)
        -> Result<Option<CollectionBinding>, StoreError>;

    async fn save_binding(&self, binding: &CollectionBinding) -> Result<(), StoreError>;
}
