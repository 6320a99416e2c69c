use crate::models::QueryFilters;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub const DENSE_VECTOR: &str = "dense";
pub const SPARSE_VECTOR: &str = "sparse";

pub const FIELD_PROJECT_ID: &str = "project_id";
pub const FIELD_DOC_ID: &str = "doc_id";
pub const FIELD_CITEKEY: &str = "citekey";
pub const FIELD_YEAR: &str = "year";
pub const FIELD_TAGS: &str = "tags";
pub const FIELD_TEXT: &str = "text";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseVector {
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn dot(&self, other: &SparseVector) -> f32 {
        self.indices
            .iter()
            .zip(&self.values)
            .filter_map(|(index, value)| {
                other
                    .indices
                    .iter()
                    .position(|candidate| candidate == index)
                    .map(|position| value * other.values[position])
            })
            .sum()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PointVectors {
    pub dense: Vec<f32>,
    pub sparse: Option<SparseVector>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Point {
    pub id: String,
    pub vectors: PointVectors,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FieldIndexKind {
    Keyword,
    Integer,
    Text,
}

impl FieldIndexKind {
    pub fn schema_name(&self) -> &'static str {
        match self {
            FieldIndexKind::Keyword => "keyword",
            FieldIndexKind::Integer => "integer",
            FieldIndexKind::Text => "text",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct OnDiskFlags {
    pub vectors: bool,
    pub payload: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    pub name: String,
    pub dense_dimensions: usize,
    pub sparse: bool,
    pub on_disk: OnDiskFlags,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionDescriptor {
    pub name: String,
    pub dense_dimensions: Option<usize>,
    pub has_sparse: bool,
    pub indexed_fields: Vec<String>,
    pub points_count: Option<u64>,
}

impl CollectionDescriptor {
    pub fn has_index(&self, field: &str) -> bool {
        self.indexed_fields.iter().any(|name| name == field)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Condition {
    Keyword { key: String, value: String },
    Integer { key: String, value: i64 },
    AnyKeyword { key: String, values: Vec<String> },
}

/// A store filter that always carries its project scope. Extra conditions can
/// only narrow the result set further.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointFilter {
    project_id: String,
    must: Vec<Condition>,
}

impl PointFilter {
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            must: Vec::new(),
        }
    }

    pub fn with_query_filters(mut self, filters: &QueryFilters) -> Self {
        if !filters.doc_ids.is_empty() {
            self.must.push(Condition::AnyKeyword {
                key: FIELD_DOC_ID.to_string(),
                values: filters.doc_ids.clone(),
            });
        }
        if let Some(citekey) = &filters.citekey {
            self.must.push(Condition::Keyword {
                key: FIELD_CITEKEY.to_string(),
                value: citekey.clone(),
            });
        }
        if !filters.tags.is_empty() {
            self.must.push(Condition::AnyKeyword {
                key: FIELD_TAGS.to_string(),
                values: filters.tags.clone(),
            });
        }
        if let Some(year) = filters.year {
            self.must.push(Condition::Integer {
                key: FIELD_YEAR.to_string(),
                value: i64::from(year),
            });
        }
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Every condition, project scope first.
    pub fn conditions(&self) -> Vec<Condition> {
        let mut conditions = Vec::with_capacity(self.must.len() + 1);
        conditions.push(Condition::Keyword {
            key: FIELD_PROJECT_ID.to_string(),
            value: self.project_id.clone(),
        });
        conditions.extend(self.must.iter().cloned());
        conditions
    }

    pub fn matches(&self, payload: &Value) -> bool {
        self.conditions()
            .iter()
            .all(|condition| condition_matches(condition, payload))
    }
}

fn condition_matches(condition: &Condition, payload: &Value) -> bool {
    let keyword_values = |key: &str| -> Vec<String> {
        match payload.get(key) {
            Some(Value::String(value)) => vec![value.clone()],
            Some(Value::Array(values)) => values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    };

    match condition {
        Condition::Keyword { key, value } => keyword_values(key).iter().any(|found| found == value),
        Condition::AnyKeyword { key, values } => keyword_values(key)
            .iter()
            .any(|found| values.contains(found)),
        Condition::Integer { key, value } => {
            payload.get(key).and_then(Value::as_i64) == Some(*value)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    Dense(Vec<f32>),
    Sparse(SparseVector),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreSearch {
    pub vector: QueryVector,
    pub filter: PointFilter,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f64,
    pub payload: Value,
}

/// Store point id for a chunk id. Chunk ids are 32 hex chars, which is exactly a UUID.
pub fn point_id(chunk_id: &str) -> String {
    match Uuid::try_parse(chunk_id) {
        Ok(id) => id.hyphenated().to_string(),
        Err(_) => {
            let digest = Sha256::digest(chunk_id.as_bytes());
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&digest[..16]);
            Uuid::from_bytes(bytes).hyphenated().to_string()
        }
    }
}
