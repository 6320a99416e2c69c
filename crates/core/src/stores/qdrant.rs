use crate::error::StoreError;
use crate::models::CollectionBinding;
use crate::store::{
    point_id, CollectionDescriptor, CollectionSchema, Condition, FieldIndexKind, Point,
    PointFilter, QueryVector, ScoredPoint, StoreSearch, DENSE_VECTOR, SPARSE_VECTOR,
};
use crate::traits::VectorStore;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;

const BACKEND: &str = "qdrant";

/// Qdrant over its REST API. Project bindings are kept as points in a small
/// registry collection next to the data collections.
pub struct QdrantStore {
    endpoint: String,
    registry: String,
    client: Client,
}

impl QdrantStore {
    pub fn new(
        endpoint: impl Into<String>,
        collection_prefix: &str,
        api_key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;

        let mut headers = HeaderMap::new();
        if let Some(api_key) = api_key {
            let value = HeaderValue::from_str(api_key.trim())
                .map_err(|error| StoreError::Request(format!("invalid api key: {error}")))?;
            headers.insert("api-key", value);
        }
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            registry: format!("{collection_prefix}__bindings"),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint, path.trim_start_matches('/'))
    }

    async fn ensure_registry(&self) -> Result<(), StoreError> {
        if self.describe_collection(&self.registry).await?.is_some() {
            return Ok(());
        }

        let response = self
            .client
            .put(self.url(&format!("collections/{}", self.registry)))
            .json(&json!({ "vectors": { "size": 1, "distance": "Dot" } }))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        check(response).await.map(|_| ())
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let details = response
        .text()
        .await
        .unwrap_or_else(|_| "<body unavailable>".to_string());
    Err(StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        status: status.as_u16(),
        details,
    })
}

fn filter_json(filter: &PointFilter) -> Value {
    let must: Vec<Value> = filter
        .conditions()
        .into_iter()
        .map(|condition| match condition {
            Condition::Keyword { key, value } => json!({ "key": key, "match": { "value": value } }),
            Condition::Integer { key, value } => json!({ "key": key, "match": { "value": value } }),
            Condition::AnyKeyword { key, values } => json!({ "key": key, "match": { "any": values } }),
        })
        .collect();
    json!({ "must": must })
}

fn field_schema(field: &str, kind: FieldIndexKind) -> Value {
    match kind {
        FieldIndexKind::Text => json!({
            "field_name": field,
            "field_schema": {
                "type": "text",
                "tokenizer": "word",
                "lowercase": true
            }
        }),
        other => json!({ "field_name": field, "field_schema": other.schema_name() }),
    }
}

fn parse_descriptor(name: &str, body: &Value) -> CollectionDescriptor {
    let dense_dimensions = body
        .pointer(&format!("/result/config/params/vectors/{DENSE_VECTOR}/size"))
        .and_then(Value::as_u64)
        .map(|size| size as usize);
    let has_sparse = body
        .pointer(&format!("/result/config/params/sparse_vectors/{SPARSE_VECTOR}"))
        .is_some();
    let mut indexed_fields: Vec<String> = body
        .pointer("/result/payload_schema")
        .and_then(Value::as_object)
        .map(|schema| schema.keys().cloned().collect())
        .unwrap_or_default();
    indexed_fields.sort();

    CollectionDescriptor {
        name: name.to_string(),
        dense_dimensions,
        has_sparse,
        indexed_fields,
        points_count: body.pointer("/result/points_count").and_then(Value::as_u64),
    }
}

fn point_json(point: &Point) -> Value {
    let mut vectors = json!({ DENSE_VECTOR: point.vectors.dense });
    if let Some(sparse) = &point.vectors.sparse {
        vectors[SPARSE_VECTOR] = json!({ "indices": sparse.indices, "values": sparse.values });
    }
    json!({
        "id": point.id,
        "vector": vectors,
        "payload": point.payload,
    })
}

fn search_json(request: &StoreSearch) -> Value {
    let vector = match &request.vector {
        QueryVector::Dense(dense) => json!({ "name": DENSE_VECTOR, "vector": dense }),
        QueryVector::Sparse(sparse) => json!({
            "name": SPARSE_VECTOR,
            "vector": { "indices": sparse.indices, "values": sparse.values }
        }),
    };
    json!({
        "vector": vector,
        "filter": filter_json(&request.filter),
        "limit": request.limit,
        "with_payload": true,
    })
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn describe_collection(
        &self,
        name: &str,
    ) -> Result<Option<CollectionDescriptor>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!("collections/{name}")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let body: Value = check(response).await?.json().await?;
        Ok(Some(parse_descriptor(name, &body)))
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<(), StoreError> {
        let mut body = json!({
            "vectors": {
                DENSE_VECTOR: {
                    "size": schema.dense_dimensions,
                    "distance": "Cosine",
                    "on_disk": schema.on_disk.vectors,
                }
            },
            "on_disk_payload": schema.on_disk.payload,
        });
        if schema.sparse {
            body["sparse_vectors"] = json!({
                SPARSE_VECTOR: { "index": { "on_disk": schema.on_disk.vectors } }
            });
        }

        let response = self
            .client
            .put(self.url(&format!("collections/{}", schema.name)))
            .json(&body)
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn create_payload_index(
        &self,
        collection: &str,
        field: &str,
        kind: FieldIndexKind,
    ) -> Result<(), StoreError> {
        let response = self
            .client
            .put(self.url(&format!("collections/{collection}/index?wait=true")))
            .json(&field_schema(field, kind))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn upsert_points(&self, collection: &str, points: &[Point]) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }

        let points: Vec<Value> = points.iter().map(point_json).collect();
        let response = self
            .client
            .put(self.url(&format!("collections/{collection}/points?wait=true")))
            .json(&json!({ "points": points }))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }

    async fn search(
        &self,
        collection: &str,
        request: &StoreSearch,
    ) -> Result<Vec<ScoredPoint>, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("collections/{collection}/points/search")))
            .json(&search_json(request))
            .send()
            .await?;

        let parsed: Value = check(response).await?.json().await?;
        let hits = parsed
            .pointer("/result")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(hits
            .into_iter()
            .map(|hit| ScoredPoint {
                id: match hit.pointer("/id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(Value::Number(id)) => id.to_string(),
                    _ => String::new(),
                },
                score: hit.pointer("/score").and_then(Value::as_f64).unwrap_or(0.0),
                payload: hit.get("payload").cloned().unwrap_or(Value::Null),
            })
            .collect())
    }

    async fn count(&self, collection: &str, filter: &PointFilter) -> Result<u64, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("collections/{collection}/points/count")))
            .json(&json!({ "filter": filter_json(filter), "exact": true }))
            .send()
            .await?;

        let parsed: Value = check(response).await?.json().await?;
        parsed
            .pointer("/result/count")
            .and_then(Value::as_u64)
            .ok_or_else(|| StoreError::BackendResponse {
                backend: BACKEND.to_string(),
                status: 200,
                details: "count response without result.count".to_string(),
            })
    }

    async fn load_binding(
        &self,
        project_id: &str,
    ) -> Result<Option<CollectionBinding>, StoreError> {
        let response = self
            .client
            .get(self.url(&format!(
                "collections/{}/points/{}",
                self.registry,
                point_id(project_id)
            )))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let parsed: Value = check(response).await?.json().await?;
        match parsed.pointer("/result/payload") {
            Some(payload) if !payload.is_null() => Ok(Some(serde_json::from_value(payload.clone())?)),
            _ => Ok(None),
        }
    }

    async fn save_binding(&self, binding: &CollectionBinding) -> Result<(), StoreError> {
        self.ensure_registry().await?;

        let response = self
            .client
            .put(self.url(&format!("collections/{}/points?wait=true", self.registry)))
            .json(&json!({
                "points": [{
                    "id": point_id(&binding.project_id),
                    "vector": [1.0],
                    "payload": serde_json::to_value(binding)?,
                }]
            }))
            .send()
            .await?;
        check(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::QueryFilters;
    use crate::store::{PointVectors, SparseVector};

    #[test]
    fn filter_always_contains_project_condition() {
        let filter = PointFilter::for_project("p1").with_query_filters(&QueryFilters {
            doc_ids: vec!["d1".to_string(), "d2".to_string()],
            year: Some(2021),
            ..QueryFilters::default()
        });

        let body = filter_json(&filter);
        assert_eq!(
            body,
            json!({
                "must": [
                    { "key": "project_id", "match": { "value": "p1" } },
                    { "key": "doc_id", "match": { "any": ["d1", "d2"] } },
                    { "key": "year", "match": { "value": 2021 } },
                ]
            })
        );
    }

    #[test]
    fn points_carry_named_vectors() {
        let point = Point {
            id: "01234567-89ab-cdef-0123-456789abcdef".to_string(),
            vectors: PointVectors {
                dense: vec![0.5, 0.5],
                sparse: Some(SparseVector {
                    indices: vec![3],
                    values: vec![1.0],
                }),
            },
            payload: json!({ "project_id": "p1" }),
        };

        let body = point_json(&point);
        assert_eq!(body["vector"]["dense"], json!([0.5, 0.5]));
        assert_eq!(body["vector"]["sparse"]["indices"], json!([3]));
    }

    #[test]
    fn sparse_search_targets_named_sparse_vector() {
        let request = StoreSearch {
            vector: QueryVector::Sparse(SparseVector {
                indices: vec![1, 2],
                values: vec![0.5, 0.25],
            }),
            filter: PointFilter::for_project("p1"),
            limit: 24,
        };

        let body = search_json(&request);
        assert_eq!(body["vector"]["name"], json!("sparse"));
        assert_eq!(body["limit"], json!(24));
        assert_eq!(body["filter"]["must"][0]["key"], json!("project_id"));
    }

    #[test]
    fn descriptor_reads_vectors_and_indexes() {
        let body = json!({
            "result": {
                "points_count": 42,
                "config": { "params": {
                    "vectors": { "dense": { "size": 384, "distance": "Cosine" } },
                    "sparse_vectors": { "sparse": {} }
                }},
                "payload_schema": { "project_id": {}, "doc_id": {} }
            }
        });

        let descriptor = parse_descriptor("shelf_p1", &body);
        assert_eq!(descriptor.dense_dimensions, Some(384));
        assert!(descriptor.has_sparse);
        assert!(descriptor.has_index("project_id"));
        assert_eq!(descriptor.points_count, Some(42));
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        assert!(QdrantStore::new("not a url", "shelf", None, Duration::from_secs(5)).is_err());
    }
}
