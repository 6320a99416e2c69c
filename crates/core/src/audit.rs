use crate::error::IngestError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Completed,
    Degraded,
    Failed,
}

/// One line of the ingest audit trail.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub correlation_id: String,
    pub recorded_at: DateTime<Utc>,
    pub project_id: String,
    pub doc_id: String,
    pub source_path: String,
    pub collection: Option<String>,
    pub dense_model: String,
    pub sparse_model: Option<String>,
    pub windows: usize,
    pub gaps: usize,
    pub chunks_written: usize,
    pub chunks_filtered: usize,
    pub warnings: Vec<String>,
    pub outcome: AuditOutcome,
    pub error: Option<String>,
    pub duration_seconds: f64,
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, record: &AuditRecord) -> Result<(), IngestError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullAuditLog;

#[async_trait]
impl AuditLog for NullAuditLog {
    async fn record(&self, _record: &AuditRecord) -> Result<(), IngestError> {
        Ok(())
    }
}

/// Appends records as JSON lines. The file is opened per record so rotation by
/// external tools is picked up.
#[derive(Debug)]
pub struct JsonlAuditLog {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonlAuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditLog for JsonlAuditLog {
    async fn record(&self, record: &AuditRecord) -> Result<(), IngestError> {
        let mut line = serde_json::to_string(record)
            .map_err(|error| IngestError::Audit(error.to_string()))?;
        line.push('\n');

        let _held = self
            .guard
            .lock()
            .map_err(|_| IngestError::Audit("audit log lock poisoned".to_string()))?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|error| IngestError::Audit(format!("{}: {error}", parent.display())))?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|error| IngestError::Audit(format!("{}: {error}", self.path.display())))?;
        file.write_all(line.as_bytes())
            .map_err(|error| IngestError::Audit(format!("{}: {error}", self.path.display())))?;
        Ok(())
    }
}
