use crate::models::{DocumentSource, IngestReport};
use crate::IngestError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DOC_ID_HEX_LEN: usize = 32;

pub fn discover_pdf_files(folder: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();

    for entry in WalkDir::new(folder)
        .into_iter()
        .filter_map(|item| item.ok())
    {
        if !entry.file_type().is_file() {
            continue;
        }

        let is_pdf = entry
            .path()
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

        if is_pdf {
            files.push(entry.path().to_path_buf());
        }
    }

    files.sort_unstable();
    files
}

pub fn digest_file(path: &Path) -> Result<String, IngestError> {
    let bytes = fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Describes a file for ingestion. The document id comes from the content checksum,
/// so moving or renaming a file keeps its chunk ids.
pub fn document_source(path: &Path, citekey: Option<&str>) -> Result<DocumentSource, IngestError> {
    let checksum = digest_file(path)?;
    let title_hint = path
        .file_stem()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            IngestError::MissingFileName(format!("path missing filename: {}", path.display()))
        })?;

    Ok(DocumentSource {
        doc_id: checksum[..DOC_ID_HEX_LEN].to_string(),
        path: path.to_path_buf(),
        title_hint: title_hint.to_string(),
        citekey: citekey.map(str::to_string),
        checksum,
    })
}

/// Sources for every PDF under `folder`. Unreadable files are reported, not fatal.
pub fn collect_sources(folder: &Path) -> Result<(Vec<DocumentSource>, Vec<FailedDocument>), IngestError> {
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        )));
    }

    let mut sources = Vec::new();
    let mut failures = Vec::new();
    for path in files {
        match document_source(&path, None) {
            Ok(source) => sources.push(source),
            Err(error) => failures.push(FailedDocument {
                path,
                doc_id: None,
                reason: error.to_string(),
            }),
        }
    }
    Ok((sources, failures))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedDocument {
    pub path: PathBuf,
    pub doc_id: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub reports: Vec<IngestReport>,
    pub failures: Vec<FailedDocument>,
}

impl BatchReport {
    pub fn chunks_written(&self) -> usize {
        self.reports.iter().map(|report| report.chunks_written).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{collect_sources, digest_file, discover_pdf_files, document_source};
    use std::fs::{self, File};
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn discover_pdf_files_is_recursive() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let base = dir.path();
        let nested = base.join("nested");
        fs::create_dir(&nested)?;

        File::create(base.join("a.pdf")).and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        File::create(nested.join("b.PDF"))
            .and_then(|mut file| file.write_all(b"%PDF-1.4\n%fake"))?;
        fs::write(base.join("notes.txt"), b"not a pdf")?;

        let files = discover_pdf_files(base);
        assert_eq!(files.len(), 2);
        Ok(())
    }

    #[test]
    fn checksum_is_reproducible() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let file_path = dir.path().join("a.pdf");
        fs::write(&file_path, b"abc")?;

        let first = digest_file(&file_path)?;
        let second = digest_file(&file_path)?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn doc_id_follows_content_not_location() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let original = dir.path().join("Smith 2020.pdf");
        let copy = dir.path().join("renamed.pdf");
        fs::write(&original, b"%PDF-1.4 same bytes")?;
        fs::write(&copy, b"%PDF-1.4 same bytes")?;

        let first = document_source(&original, Some("smith2020"))?;
        let second = document_source(&copy, None)?;

        assert_eq!(first.doc_id, second.doc_id);
        assert_eq!(first.doc_id.len(), 32);
        assert_eq!(first.title_hint, "Smith 2020");
        assert_eq!(first.citekey.as_deref(), Some("smith2020"));
        Ok(())
    }

    #[test]
    fn collecting_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        assert!(collect_sources(dir.path()).is_err());

        fs::write(dir.path().join("a.pdf"), b"%PDF-1.4")?;
        let (sources, failures) = collect_sources(dir.path())?;
        assert_eq!(sources.len(), 1);
        assert!(failures.is_empty());
        Ok(())
    }
}
