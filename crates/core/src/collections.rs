use crate::error::{CollectionError, StoreError};
use crate::models::CollectionBinding;
use crate::store::{
    CollectionSchema, FieldIndexKind, OnDiskFlags, FIELD_CITEKEY, FIELD_DOC_ID, FIELD_PROJECT_ID,
    FIELD_TAGS, FIELD_TEXT, FIELD_YEAR,
};
use crate::traits::VectorStore;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Embedding models a caller writes or queries with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub dense_model_id: String,
    pub dense_dimensions: usize,
    pub sparse_model_id: Option<String>,
}

impl ModelSpec {
    fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.dense_model_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.sparse_model_id.as_deref().unwrap_or_default().as_bytes());
        let mut digest = format!("{:x}", hasher.finalize());
        digest.truncate(8);
        digest
    }
}

pub struct CollectionManager {
    store: Arc<dyn VectorStore>,
    prefix: String,
}

impl CollectionManager {
    pub fn new(store: Arc<dyn VectorStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Stable, store-safe collection name for a project.
    pub fn collection_name(&self, project_id: &str) -> String {
        let sanitized: String = project_id
            .chars()
            .map(|character| {
                if character.is_ascii_alphanumeric() || character == '-' || character == '_' {
                    character.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();

        if sanitized == project_id {
            format!("{}_{}", self.prefix, sanitized)
        } else {
            let mut digest = format!("{:x}", Sha256::digest(project_id.as_bytes()));
            digest.truncate(8);
            format!("{}_{}_{}", self.prefix, sanitized, digest)
        }
    }

    /// Creates the project's collection on first use and refuses to mix embedding
    /// models in it afterwards. With `migrate`, a differently bound project gets a
    /// fresh collection; the old one is left untouched.
    pub async fn ensure_collection(
        &self,
        project_id: &str,
        models: &ModelSpec,
        on_disk: OnDiskFlags,
        migrate: bool,
    ) -> Result<CollectionBinding, CollectionError> {
        let existing = self.store.load_binding(project_id).await?;

        let binding = match existing {
            None => {
                let name = self.collection_name(project_id);
                self.provision(&name, models, on_disk).await?;

                // Another writer may have bound the project while we provisioned.
                if let Some(raced) = self.store.load_binding(project_id).await? {
                    if !raced.matches(&models.dense_model_id, models.sparse_model_id.as_deref()) {
                        return Err(mismatch(
                            &raced,
                            &models.dense_model_id,
                            models.sparse_model_id.as_deref(),
                        ));
                    }
                    debug!(project_id, collection = %raced.collection_name, "project bound concurrently");
                    return Ok(raced);
                }

                let binding = CollectionBinding {
                    project_id: project_id.to_string(),
                    collection_name: name,
                    dense_model_id: models.dense_model_id.clone(),
                    dense_dimensions: models.dense_dimensions,
                    sparse_model_id: models.sparse_model_id.clone(),
                    created_at: Utc::now(),
                    previous_collections: Vec::new(),
                };
                self.store.save_binding(&binding).await?;
                info!(
                    project_id,
                    collection = %binding.collection_name,
                    dense_model = %binding.dense_model_id,
                    sparse_model = ?binding.sparse_model_id,
                    "created project collection"
                );
                binding
            }
            Some(binding)
                if binding.matches(&models.dense_model_id, models.sparse_model_id.as_deref()) =>
            {
                self.provision(&binding.collection_name, models, on_disk).await?;
                debug!(project_id, collection = %binding.collection_name, "collection binding matches");
                binding
            }
            Some(binding) if migrate => {
                let name = format!(
                    "{}_m{}",
                    self.collection_name(project_id),
                    models.digest()
                );
                self.provision(&name, models, on_disk).await?;

                let mut previous_collections = binding.previous_collections.clone();
                previous_collections.push(binding.collection_name.clone());
                let migrated = CollectionBinding {
                    project_id: project_id.to_string(),
                    collection_name: name,
                    dense_model_id: models.dense_model_id.clone(),
                    dense_dimensions: models.dense_dimensions,
                    sparse_model_id: models.sparse_model_id.clone(),
                    created_at: Utc::now(),
                    previous_collections,
                };
                self.store.save_binding(&migrated).await?;
                warn!(
                    project_id,
                    from = %binding.collection_name,
                    to = %migrated.collection_name,
                    dense_model = %migrated.dense_model_id,
                    "migrated project to a new collection"
                );
                migrated
            }
            Some(binding) => {
                return Err(mismatch(
                    &binding,
                    &models.dense_model_id,
                    models.sparse_model_id.as_deref(),
                ))
            }
        };

        Ok(binding)
    }

    /// Checks that a project can serve a query embedded with `models`.
    pub async fn resolve_for_query(
        &self,
        project_id: &str,
        models: &ModelSpec,
        hybrid: bool,
    ) -> Result<CollectionBinding, CollectionError> {
        let binding = self
            .store
            .load_binding(project_id)
            .await?
            .ok_or_else(|| CollectionError::ProjectNotFound(project_id.to_string()))?;

        if binding.dense_model_id != models.dense_model_id {
            return Err(mismatch(
                &binding,
                &models.dense_model_id,
                models.sparse_model_id.as_deref(),
            ));
        }

        if hybrid {
            match (&binding.sparse_model_id, &models.sparse_model_id) {
                (None, _) | (_, None) => {
                    return Err(CollectionError::HybridNotSupported(project_id.to_string()))
                }
                (Some(bound), Some(requested)) if bound != requested => {
                    return Err(mismatch(&binding, &models.dense_model_id, Some(requested)))
                }
                _ => {}
            }
        }

        let descriptor = self
            .store
            .describe_collection(&binding.collection_name)
            .await?
            .ok_or_else(|| CollectionError::ProjectNotFound(project_id.to_string()))?;

        if !descriptor.has_index(FIELD_PROJECT_ID) {
            return Err(CollectionError::IndexUnavailable {
                collection: binding.collection_name.clone(),
                index: FIELD_PROJECT_ID.to_string(),
            });
        }
        if hybrid && !descriptor.has_sparse {
            return Err(CollectionError::IndexUnavailable {
                collection: binding.collection_name.clone(),
                index: "sparse".to_string(),
            });
        }

        Ok(binding)
    }

    /// Idempotent: creates the collection if missing and any missing payload index.
    async fn provision(
        &self,
        name: &str,
        models: &ModelSpec,
        on_disk: OnDiskFlags,
    ) -> Result<(), CollectionError> {
        let descriptor = match self.store.describe_collection(name).await? {
            Some(descriptor) => descriptor,
            None => {
                let created = self
                    .store
                    .create_collection(&CollectionSchema {
                        name: name.to_string(),
                        dense_dimensions: models.dense_dimensions,
                        sparse: models.sparse_model_id.is_some(),
                        on_disk,
                    })
                    .await;
                match created {
                    Ok(()) => Default::default(),
                    // Lost a creation race: adopt the collection the winner made.
                    Err(error) => match self.store.describe_collection(name).await? {
                        Some(descriptor) => {
                            debug!(collection = name, %error, "collection created concurrently");
                            descriptor
                        }
                        None => return Err(error.into()),
                    },
                }
            }
        };

        if let Some(dimensions) = descriptor.dense_dimensions {
            if dimensions != models.dense_dimensions {
                return Err(CollectionError::Store(StoreError::Request(format!(
                    "collection `{name}` stores {dimensions}-dimensional vectors, model `{}` produces {}",
                    models.dense_model_id, models.dense_dimensions
                ))));
            }
        }

        let mut indexes = vec![
            (FIELD_PROJECT_ID, FieldIndexKind::Keyword),
            (FIELD_DOC_ID, FieldIndexKind::Keyword),
            (FIELD_CITEKEY, FieldIndexKind::Keyword),
            (FIELD_TAGS, FieldIndexKind::Keyword),
            (FIELD_YEAR, FieldIndexKind::Integer),
        ];
        if models.sparse_model_id.is_some() {
            indexes.push((FIELD_TEXT, FieldIndexKind::Text));
        }

        for (field, kind) in indexes {
            if !descriptor.has_index(field) {
                self.store.create_payload_index(name, field, kind).await?;
            }
        }
        Ok(())
    }
}

fn mismatch(
    binding: &CollectionBinding,
    requested_dense: &str,
    requested_sparse: Option<&str>,
) -> CollectionError {
    CollectionError::EmbeddingModelMismatch {
        project_id: binding.project_id.clone(),
        collection: binding.collection_name.clone(),
        bound_dense: binding.dense_model_id.clone(),
        bound_sparse: binding.sparse_model_id.clone(),
        requested_dense: requested_dense.to_string(),
        requested_sparse: requested_sparse.map(str::to_string),
    }
}
