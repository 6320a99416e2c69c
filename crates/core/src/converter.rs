use crate::chunking::normalize_whitespace;
use crate::error::ConversionError;
use crate::models::{DocumentSource, HeadingNode, PageMapEntry, PageRange};
use crate::traits::{ConvertedWindow, Converter};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::Document;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

const PAGE_SEPARATOR: &str = "\n\n";

fn load_pdf(path: &Path) -> Result<Document, ConversionError> {
    Document::load(path)
        .map_err(|error| ConversionError::PdfParse(format!("{}: {error}", path.display())))
}

pub fn pdf_page_count(path: &Path) -> Result<u32, ConversionError> {
    Ok(load_pdf(path)?.get_pages().len() as u32)
}

/// Accumulates page texts into one window, recording page offsets and headings.
#[derive(Debug, Default)]
struct WindowBuilder {
    text: String,
    page_map: Vec<PageMapEntry>,
    headings: Vec<HeadingNode>,
}

impl WindowBuilder {
    fn push_page(&mut self, page_number: u32, text: &str) -> usize {
        if !self.text.is_empty() {
            self.text.push_str(PAGE_SEPARATOR);
        }
        let start_offset = self.text.len();
        self.text.push_str(text);
        self.page_map.push(PageMapEntry {
            page_number,
            start_offset,
            end_offset: self.text.len(),
        });
        start_offset
    }

    fn finish(self) -> ConvertedWindow {
        ConvertedWindow {
            plain_text: self.text,
            page_map: self.page_map,
            heading_tree: nest_headings(self.headings),
        }
    }
}

/// Rebuilds a tree from headings listed in document order.
pub fn nest_headings(flat: Vec<HeadingNode>) -> Vec<HeadingNode> {
    fn attach(siblings: &mut Vec<HeadingNode>, node: HeadingNode) {
        match siblings.last_mut() {
            Some(last) if last.level < node.level => attach(&mut last.children, node),
            _ => siblings.push(node),
        }
    }

    let mut roots = Vec::new();
    for node in flat {
        attach(&mut roots, node);
    }
    roots
}

/// Finds numbered headings such as `2 Methods` or `3.1.4 Sampling design`.
#[derive(Debug, Clone)]
pub struct HeadingDetector {
    pattern: Regex,
}

impl HeadingDetector {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"(?m)^[ \t]*(\d+(?:\.\d+)*)\.?[ \t]+(\p{Lu}[^\n]{0,118})$")?,
        })
    }

    pub fn detect(&self, text: &str, page_number: u32, base_offset: usize) -> Vec<HeadingNode> {
        self.pattern
            .captures_iter(text)
            .filter_map(|capture| {
                let whole = capture.get(0)?;
                let numbering = capture.get(1)?.as_str();
                let title = normalize_whitespace(capture.get(2)?.as_str());
                let level = numbering.split('.').count().min(u8::MAX as usize) as u8;
                Some(HeadingNode {
                    level,
                    title: format!("{numbering} {title}"),
                    page_anchor: page_number,
                    offset: base_offset + whole.start(),
                    children: Vec::new(),
                })
            })
            .collect()
    }
}

struct LoadedPdf {
    path: PathBuf,
    checksum: String,
    document: Arc<Document>,
}

/// Converter backed by the PDF's own text layer. The parsed document is kept
/// for the source most recently converted, so its windows share one parse.
#[derive(Clone)]
pub struct LopdfConverter {
    headings: HeadingDetector,
    loaded: Arc<Mutex<Option<LoadedPdf>>>,
}

impl LopdfConverter {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            headings: HeadingDetector::new()?,
            loaded: Arc::new(Mutex::new(None)),
        })
    }

    async fn document(&self, source: &DocumentSource) -> Result<Arc<Document>, ConversionError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(cached) = loaded.as_ref() {
            if cached.path == source.path && cached.checksum == source.checksum {
                return Ok(Arc::clone(&cached.document));
            }
        }

        let path = source.path.clone();
        let document = tokio::task::spawn_blocking(move || load_pdf(&path))
            .await
            .map_err(|error| ConversionError::PdfParse(format!("pdf load task failed: {error}")))??;
        let document = Arc::new(document);
        debug!(doc_id = %source.doc_id, pages = document.get_pages().len(), "parsed pdf");

        *loaded = Some(LoadedPdf {
            path: source.path.clone(),
            checksum: source.checksum.clone(),
            document: Arc::clone(&document),
        });
        Ok(document)
    }

    fn convert_loaded(
        &self,
        document: &Document,
        pages: Option<PageRange>,
    ) -> Result<ConvertedWindow, ConversionError> {
        let mut builder = WindowBuilder::default();
        for (page_number, _page_id) in document.get_pages() {
            if pages.is_some_and(|range| !range.contains(page_number)) {
                continue;
            }

            let text = document
                .extract_text(&[page_number])
                .map_err(|error| ConversionError::PdfParse(error.to_string()))?;
            let text = text.trim_end();
            if text.trim().is_empty() {
                continue;
            }

            let offset = builder.push_page(page_number, text);
            let found = self.headings.detect(text, page_number, offset);
            builder.headings.extend(found);
        }

        Ok(builder.finish())
    }
}

#[async_trait]
impl Converter for LopdfConverter {
    async fn convert(
        &self,
        source: &DocumentSource,
        pages: Option<PageRange>,
    ) -> Result<ConvertedWindow, ConversionError> {
        let document = self.document(source).await?;
        let converter = self.clone();
        tokio::task::spawn_blocking(move || converter.convert_loaded(&document, pages))
            .await
            .map_err(|error| ConversionError::PdfParse(format!("conversion task failed: {error}")))?
    }

    async fn page_count(&self, source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
        let document = self.document(source).await?;
        Ok(Some(document.get_pages().len() as u32))
    }
}

#[derive(Debug, Clone, Serialize)]
struct ConvertRequest {
    pdf_base64: String,
    source_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_start: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    page_end: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ConvertResponse {
    #[serde(default)]
    pages: Option<Vec<RemotePage>>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    headings: Vec<RemoteHeading>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemotePage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteHeading {
    #[serde(default = "default_heading_level")]
    level: u8,
    title: String,
    #[serde(default)]
    page: Option<u32>,
    /// Character (not byte) offset within the returned text.
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    children: Vec<RemoteHeading>,
}

fn default_heading_level() -> u8 {
    1
}

#[derive(Debug, Clone)]
pub struct HttpConverterConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

/// Converter that delegates layout analysis and OCR to a remote service.
#[derive(Debug, Clone)]
pub struct HttpConverter {
    client: Client,
    config: HttpConverterConfig,
}

impl HttpConverter {
    pub fn new(config: HttpConverterConfig) -> Result<Self, ConversionError> {
        url::Url::parse(&config.endpoint)
            .map_err(|error| ConversionError::InvalidResponse(format!("invalid endpoint: {error}")))?;
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Converter for HttpConverter {
    async fn convert(
        &self,
        source: &DocumentSource,
        pages: Option<PageRange>,
    ) -> Result<ConvertedWindow, ConversionError> {
        let pdf = tokio::fs::read(&source.path).await?;
        let payload = ConvertRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: source.path.to_string_lossy().to_string(),
            page_start: pages.map(|range| range.start),
            page_end: pages.map(|range| range.end),
        };

        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&payload);
        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ConversionError::BackendResponse {
                status: response.status().as_u16(),
                details: format!("conversion request to {} failed", self.config.endpoint),
            });
        }

        let payload: ConvertResponse = response.json().await?;
        payload_to_window(&payload, pages.map(|range| range.start).unwrap_or(1), &source.path)
    }

    async fn page_count(&self, source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
        let path: PathBuf = source.path.clone();
        let counted = tokio::task::spawn_blocking(move || pdf_page_count(&path))
            .await
            .map_err(|error| ConversionError::PdfParse(format!("page count task failed: {error}")))?;
        Ok(counted.ok())
    }
}

fn payload_to_window(
    payload: &ConvertResponse,
    first_page: u32,
    path: &Path,
) -> Result<ConvertedWindow, ConversionError> {
    let mut builder = WindowBuilder::default();

    if let Some(listed) = &payload.pages {
        for (index, page) in listed.iter().enumerate() {
            let text = page.text.as_deref().map(str::trim).unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            let number = page.page.unwrap_or(first_page + index as u32);
            builder.push_page(number, text);
        }
    }

    if builder.page_map.is_empty() {
        if let Some(raw_text) = &payload.text {
            for (index, chunk) in raw_text.split('\u{000c}').enumerate() {
                let normalized = chunk.trim();
                if !normalized.is_empty() {
                    builder.push_page(first_page + index as u32, normalized);
                }
            }
        }
    }

    if builder.page_map.is_empty() {
        return Err(ConversionError::InvalidResponse(format!(
            "conversion response was empty for {}",
            path.display()
        )));
    }

    let heading_tree = payload
        .headings
        .iter()
        .map(|heading| remote_heading(heading, &builder))
        .collect();

    Ok(ConvertedWindow {
        plain_text: builder.text,
        page_map: builder.page_map,
        heading_tree,
    })
}

fn remote_heading(heading: &RemoteHeading, builder: &WindowBuilder) -> HeadingNode {
    let page_entry = heading.page.and_then(|page| {
        builder
            .page_map
            .iter()
            .find(|entry| entry.page_number == page)
    });

    let offset = match heading.offset {
        Some(chars) => builder
            .text
            .char_indices()
            .nth(chars)
            .map(|(byte, _)| byte)
            .unwrap_or(builder.text.len()),
        None => {
            let search_from = page_entry.map(|entry| entry.start_offset).unwrap_or(0);
            builder.text[search_from..]
                .find(heading.title.trim())
                .map(|found| search_from + found)
                .unwrap_or(search_from)
        }
    };

    let page_anchor = heading
        .page
        .or_else(|| {
            builder
                .page_map
                .iter()
                .rev()
                .find(|entry| entry.start_offset <= offset)
                .map(|entry| entry.page_number)
        })
        .unwrap_or(0);

    HeadingNode {
        level: heading.level.max(1),
        title: normalize_whitespace(&heading.title),
        page_anchor,
        offset,
        children: heading
            .children
            .iter()
            .map(|child| remote_heading(child, builder))
            .collect(),
    }
}
