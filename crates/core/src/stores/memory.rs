//! In-memory [`VectorStore`] for tests and offline runs.
//!
//! Collections, points and bindings live behind `std::sync::RwLock`. Dense search
//! is brute-force cosine similarity; sparse search is a dot product over shared
//! indices and, like a real sparse index, skips points with no overlap.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::CollectionBinding;
use crate::store::{
    CollectionDescriptor, CollectionSchema, FieldIndexKind, Point, PointFilter, QueryVector,
    ScoredPoint, StoreSearch,
};
use crate::traits::VectorStore;

const BACKEND: &str = "memory";

struct StoredCollection {
    schema: CollectionSchema,
    indexed: BTreeSet<String>,
    points: BTreeMap<String, Point>,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, StoredCollection>>,
    bindings: RwLock<HashMap<String, CollectionBinding>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn point_count(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|collections| {
                collections
                    .get(collection)
                    .map(|stored| stored.points.len())
                    .unwrap_or(0)
            })
            .unwrap_or(0)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .collections
            .read()
            .map(|collections| collections.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, StoredCollection>>, StoreError> {
        self.collections
            .read()
            .map_err(|_| StoreError::Request("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, StoredCollection>>, StoreError> {
        self.collections
            .write()
            .map_err(|_| StoreError::Request("memory store lock poisoned".to_string()))
    }
}

fn missing(collection: &str) -> StoreError {
    StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        status: 404,
        details: format!("collection `{collection}` does not exist"),
    }
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[async_trait]
impl VectorStore for MemoryStore {
    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionDescriptor>, StoreError> {
        let collections = self.read()?;
        Ok(collections.get(name).map(|stored| CollectionDescriptor {
            name: name.to_string(),
            dense_dimensions: Some(stored.schema.dense_dimensions),
            has_sparse: stored.schema.sparse,
            indexed_fields: stored.indexed.iter().cloned().collect(),
            points_count: Some(stored.points.len() as u64),
        }))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        if collections.contains_key(&schema.name) {
            return Err(StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                status: 409,
                details: format!("collection `{}` already exists", schema.name),
            });
        }
        collections.insert(
            schema.name.clone(),
            StoredCollection {
                schema: schema.clone(),
                indexed: BTreeSet::new(),
                points: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        _kind: FieldIndexKind,
    ) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        let stored = collections.get_mut(collection).ok_or_else(|| missing(collection))?;
        stored.indexed.insert(field.to_string());
        Ok(())
    }

    async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<(), StoreError> {
        let mut collections = self.write()?;
        let stored = collections.get_mut(collection).ok_or_else(|| missing(collection))?;

        for point in points {
            if point.vectors.dense.len() != stored.schema.dense_dimensions {
                return Err(StoreError::BackendResponse {
                    backend: BACKEND.to_string(),
                    status: 400,
                    details: format!(
                        "dense vector dimension {} != {}",
                        point.vectors.dense.len(),
                        stored.schema.dense_dimensions
                    ),
                });
            }
            if point.vectors.sparse.is_some() && !stored.schema.sparse {
                return Err(StoreError::BackendResponse {
                    backend: BACKEND.to_string(),
                    status: 400,
                    details: format!("collection `{collection}` has no sparse vector slot"),
                });
            }
        }

        for point in points {
            stored.points.insert(point.id.clone(), point.clone());
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        request: &StoreSearch,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let collections = self.read()?;
        let stored = collections.get(collection).ok_or_else(|| missing(collection))?;

        let mut hits: Vec<ScoredPoint> = stored
            .points
            .values()
            .filter(|point| request.filter.matches(&point.payload))
            .filter_map(|point| {
                let score = match &request.vector {
                    QueryVector::Dense(vector) => cosine_sim(vector, &point.vectors.dense),
                    QueryVector::Sparse(vector) => {
                        let score = point
                            .vectors
                            .sparse
                            .as_ref()
                            .map(|sparse| vector.dot(sparse))
                            .unwrap_or(0.0);
                        if score <= 0.0 {
                            return None;
                        }
                        score
                    }
                };
                Some(ScoredPoint {
                    id: point.id.clone(),
                    score: f64::from(score),
                    payload: point.payload.clone(),
                })
            })
            .collect();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then_with(|| left.id.cmp(&right.id))
        });
        hits.truncate(request.limit);
        Ok(hits)
    }

    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<u64, StoreError> {
        let collections = self.read()?;
        let stored = collections.get(collection).ok_or_else(|| missing(collection))?;
        Ok(stored
            .points
            .values()
            .filter(|point| filter.matches(&point.payload))
            .count() as u64)
    }

    async fn load_binding(
        &self,
        project_id: &str,
    ) -> Result<Option<CollectionBinding>, StoreError> {
        let bindings = self
            .bindings
            .read()
            .map_err(|_| StoreError::Request("memory store lock poisoned".to_string()))?;
        Ok(bindings.get(project_id).cloned())
    }

    async fn save_binding(&self, binding: &CollectionBinding) -> Result<(), StoreError> {
        let mut bindings = self
            .bindings
            .write()
            .map_err(|_| StoreError::Request("memory store lock poisoned".to_string()))?;
        bindings.insert(binding.project_id.clone(), binding.clone());
        Ok(())
    }
}
