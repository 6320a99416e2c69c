use crate::error::IngestError;
use crate::models::CitationMeta;
use crate::traits::{MetadataLookup, MetadataResolver};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMetadata;

#[async_trait]
impl MetadataResolver for NoMetadata {
    async fn resolve(&self, _citekey: Option<&str>, _doc_id: &str, _hint: &str) -> MetadataLookup {
        MetadataLookup::Missing
    }
}

#[derive(Debug, Clone, Deserialize)]
struct LibraryEntry {
    #[serde(flatten)]
    meta: CitationMeta,
    #[serde(default)]
    doc_ids: Vec<String>,
    #[serde(default)]
    files: Vec<String>,
}

/// Resolves citations from an exported reference library (a JSON array).
/// Lookup order: citekey, document id, then the hint against attached file
/// names and titles.
#[derive(Debug, Clone, Default)]
pub struct JsonMetadataResolver {
    entries: Vec<CitationMeta>,
    by_citekey: HashMap<String, usize>,
    by_doc_id: HashMap<String, usize>,
    by_hint: HashMap<String, usize>,
    ambiguous_hints: HashSet<String>,
}

impl JsonMetadataResolver {
    pub fn from_path(path: &Path) -> Result<Self, IngestError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, IngestError> {
        let library: Vec<LibraryEntry> = serde_json::from_str(raw)
            .map_err(|error| IngestError::InvalidArgument(format!("metadata library: {error}")))?;

        let mut resolver = Self::default();
        for entry in library {
            let position = resolver.entries.len();
            resolver.by_citekey.insert(entry.meta.citekey.clone(), position);
            for doc_id in entry.doc_ids {
                resolver.by_doc_id.insert(doc_id, position);
            }
            for file in &entry.files {
                let stem = Path::new(file)
                    .file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or(file);
                resolver.add_hint(hint_key(stem), position);
            }
            if let Some(title) = &entry.meta.title {
                resolver.add_hint(hint_key(title), position);
            }
            resolver.entries.push(entry.meta);
        }
        Ok(resolver)
    }

    /// A hint shared by two different entries identifies neither of them.
    fn add_hint(&mut self, key: String, position: usize) {
        if key.is_empty() || self.ambiguous_hints.contains(&key) {
            return;
        }
        match self.by_hint.get(&key) {
            Some(existing) if *existing != position => {
                warn!(hint = %key, "title or file name shared by several library entries");
                self.by_hint.remove(&key);
                self.ambiguous_hints.insert(key);
            }
            Some(_) => {}
            None => {
                self.by_hint.insert(key, position);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn hint_key(value: &str) -> String {
    let trimmed = value.trim();
    let name = match trimmed.len().checked_sub(4) {
        Some(cut)
            if trimmed.is_char_boundary(cut) && trimmed[cut..].eq_ignore_ascii_case(".pdf") =>
        {
            &trimmed[..cut]
        }
        _ => trimmed,
    };
    name.chars()
        .filter(|character| character.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

#[async_trait]
impl MetadataResolver for JsonMetadataResolver {
    async fn resolve(&self, citekey: Option<&str>, doc_id: &str, hint: &str) -> MetadataLookup {
        let position = citekey
            .and_then(|key| self.by_citekey.get(key))
            .or_else(|| self.by_doc_id.get(doc_id))
            .or_else(|| {
                let key = hint_key(hint);
                (!key.is_empty()).then(|| self.by_hint.get(&key)).flatten()
            });

        match position.and_then(|position| self.entries.get(*position)) {
            Some(meta) => MetadataLookup::Found(meta.clone()),
            None => MetadataLookup::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"[
        {
            "citekey": "smith2020soil",
            "title": "Soil Carbon Dynamics",
            "authors": ["Smith, J.", "Okafor, A."],
            "year": 2020,
            "doi": "10.1000/soil.2020",
            "tags": ["soil", "carbon"],
            "files": ["/library/Smith 2020 - Soil Carbon.pdf"]
        },
        {
            "citekey": "lee2019",
            "doc_ids": ["abc123"]
        }
    ]"#;

    #[tokio::test]
    async fn resolves_by_citekey_doc_id_and_file_hint() {
        let resolver = JsonMetadataResolver::from_json(LIBRARY).expect("library parses");
        assert_eq!(resolver.len(), 2);

        let by_key = resolver.resolve(Some("smith2020soil"), "x", "").await;
        assert!(matches!(by_key, MetadataLookup::Found(meta) if meta.year == Some(2020)));

        let by_doc = resolver.resolve(None, "abc123", "").await;
        assert!(matches!(by_doc, MetadataLookup::Found(meta) if meta.citekey == "lee2019"));

        let by_file = resolver
            .resolve(None, "unknown", "smith 2020 - soil carbon.pdf")
            .await;
        assert!(matches!(by_file, MetadataLookup::Found(meta) if meta.citekey == "smith2020soil"));
    }

    #[tokio::test]
    async fn unknown_documents_are_missing_not_errors() {
        let resolver = JsonMetadataResolver::from_json(LIBRARY).expect("library parses");
        assert_eq!(
            resolver.resolve(Some("nobody1999"), "zzz", "untitled").await,
            MetadataLookup::Missing
        );
        assert_eq!(NoMetadata.resolve(None, "zzz", "").await, MetadataLookup::Missing);
    }

    #[tokio::test]
    async fn dotted_titles_keep_their_own_entries() {
        let library = r#"[
            { "citekey": "vol1", "title": "Annual Report Vol. 1", "year": 2021 },
            { "citekey": "vol2", "title": "Annual Report Vol. 2", "year": 2022 },
            { "citekey": "blank", "title": "..." }
        ]"#;
        let resolver = JsonMetadataResolver::from_json(library).expect("library parses");

        let first = resolver.resolve(None, "x", "Annual Report Vol. 1").await;
        assert!(matches!(first, MetadataLookup::Found(meta) if meta.citekey == "vol1"));
        let second = resolver.resolve(None, "x", "Annual Report Vol. 2").await;
        assert!(matches!(second, MetadataLookup::Found(meta) if meta.citekey == "vol2"));

        assert_eq!(resolver.resolve(None, "x", "").await, MetadataLookup::Missing);
        assert_eq!(resolver.resolve(None, "x", "!!").await, MetadataLookup::Missing);
    }

    #[tokio::test]
    async fn shared_titles_resolve_to_nothing() {
        let library = r#"[
            { "citekey": "a2020", "title": "Introduction" },
            { "citekey": "b2021", "title": "Introduction" },
            { "citekey": "c2022", "title": "Introduction" }
        ]"#;
        let resolver = JsonMetadataResolver::from_json(library).expect("library parses");

        assert_eq!(
            resolver.resolve(None, "x", "Introduction").await,
            MetadataLookup::Missing
        );
        let by_key = resolver.resolve(Some("b2021"), "x", "Introduction").await;
        assert!(matches!(by_key, MetadataLookup::Found(meta) if meta.citekey == "b2021"));
    }

    #[test]
    fn malformed_library_is_rejected() {
        assert!(JsonMetadataResolver::from_json("{not json").is_err());
    }
}
