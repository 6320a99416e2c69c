use crate::error::ConversionError;
use crate::models::{
    ConversionResult, ConversionWindow, DocumentSource, HeadingNode, PageMapEntry, WindowGap,
};
use crate::traits::{ConvertedWindow, Converter};
use crate::windows::{plan_windows, WindowingOptions};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

const SEAM_SEPARATOR: &str = "\n\n";
const MIN_SEAM_MATCH_CHARS: usize = 32;

#[derive(Debug, Clone)]
pub struct ConversionOptions {
    pub max_workers: usize,
    /// One retry per entry, sleeping that long before it.
    pub retry_delays: Vec<Duration>,
    pub window_timeout: Duration,
    pub max_seam_chars: usize,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            max_workers: 4,
            retry_delays: vec![Duration::from_secs(1), Duration::from_secs(3)],
            window_timeout: Duration::from_secs(120),
            max_seam_chars: 4_000,
        }
    }
}

/// Result of converting one window after retries. Failures are a gap, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowOutcome {
    Converted(ConvertedWindow),
    Gap { reason: String },
}

#[derive(Debug, Clone, Default)]
pub struct ConvertedDocument {
    pub result: ConversionResult,
    pub windows: usize,
    pub warnings: Vec<String>,
}

pub struct ConversionOrchestrator {
    converter: Arc<dyn Converter>,
    windowing: WindowingOptions,
    options: ConversionOptions,
}

impl ConversionOrchestrator {
    pub fn new(
        converter: Arc<dyn Converter>,
        windowing: WindowingOptions,
        options: ConversionOptions,
    ) -> Self {
        Self {
            converter,
            windowing,
            options,
        }
    }

    pub async fn convert_document(&self, source: &DocumentSource) -> ConvertedDocument {
        let page_count = match self.converter.page_count(source).await {
            Ok(count) => count,
            Err(error) if error.is_unreadable() => return self.unreadable(source, error),
            Err(error) => {
                warn!(doc_id = %source.doc_id, %error, "page count unavailable");
                None
            }
        };
        let windows = plan_windows(&source.doc_id, page_count, &self.windowing);
        info!(
            doc_id = %source.doc_id,
            page_count = ?page_count,
            windows = windows.len(),
            "planned conversion windows"
        );

        if let [window] = windows.as_slice() {
            if window.page_range.is_none() {
                return self.convert_unbounded(source, window).await;
            }
        }

        self.convert_windows(source, &windows).await
    }

    async fn probe_page_count(&self, source: &DocumentSource) -> Option<u32> {
        match self.converter.page_count(source).await {
            Ok(count) => count,
            Err(error) => {
                warn!(doc_id = %source.doc_id, %error, "page count unavailable");
                None
            }
        }
    }

    fn unreadable(&self, source: &DocumentSource, error: ConversionError) -> ConvertedDocument {
        warn!(doc_id = %source.doc_id, %error, "document cannot be read");
        let window = ConversionWindow {
            doc_id: source.doc_id.clone(),
            window_index: 0,
            page_range: None,
        };
        let mut merger = DocumentMerger::new(&source.doc_id, &self.windowing, &self.options);
        merger.merge(
            &window,
            WindowOutcome::Gap {
                reason: format!("unreadable document: {error}"),
            },
        );
        merger.finish(1)
    }

    /// The page count was unknown: try the whole document once, and if that fails
    /// fall back to fixed windows as soon as the page count can be learned.
    async fn convert_unbounded(
        &self,
        source: &DocumentSource,
        window: &ConversionWindow,
    ) -> ConvertedDocument {
        let outcome = convert_with_retry(
            Arc::clone(&self.converter),
            source.clone(),
            window.clone(),
            self.options.clone(),
        )
        .await;

        if let WindowOutcome::Gap { reason } = &outcome {
            if let Some(page_count) = self.probe_page_count(source).await {
                warn!(
                    doc_id = %source.doc_id,
                    page_count,
                    %reason,
                    "unbounded conversion failed, splitting into windows"
                );
                let forced = WindowingOptions {
                    force_windowed: true,
                    ..self.windowing
                };
                let windows = plan_windows(&source.doc_id, Some(page_count), &forced);
                return self.convert_windows(source, &windows).await;
            }
        }

        let mut merger = DocumentMerger::new(&source.doc_id, &self.windowing, &self.options);
        merger.merge(window, outcome);
        merger.finish(1)
    }

    async fn convert_windows(
        &self,
        source: &DocumentSource,
        windows: &[ConversionWindow],
    ) -> ConvertedDocument {
        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut tasks = JoinSet::new();

        for window in windows {
            let converter = Arc::clone(&self.converter);
            let semaphore = Arc::clone(&semaphore);
            let source = source.clone();
            let window = window.clone();
            let options = self.options.clone();

            tasks.spawn(async move {
                let index = window.window_index;
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => convert_with_retry(converter, source, window, options).await,
                    Err(error) => WindowOutcome::Gap {
                        reason: format!("worker pool closed: {error}"),
                    },
                };
                (index, outcome)
            });
        }

        let mut merger = DocumentMerger::new(&source.doc_id, &self.windowing, &self.options);
        let mut pending = BTreeMap::new();
        let mut next = 0usize;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    pending.insert(index, outcome);
                }
                Err(error) => warn!(doc_id = %source.doc_id, %error, "conversion task aborted"),
            }

            while let Some(outcome) = pending.remove(&next) {
                merger.merge(&windows[next], outcome);
                next += 1;
            }
        }

        for window in &windows[next..] {
            let outcome = pending.remove(&window.window_index).unwrap_or(WindowOutcome::Gap {
                reason: "conversion task aborted".to_string(),
            });
            merger.merge(window, outcome);
        }

        merger.finish(windows.len())
    }
}

async fn convert_with_retry(
    converter: Arc<dyn Converter>,
    source: DocumentSource,
    window: ConversionWindow,
    options: ConversionOptions,
) -> WindowOutcome {
    let attempts = options.retry_delays.len() + 1;
    let mut last_error = String::new();

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(options.retry_delays[attempt - 1]).await;
        }

        let call = converter.convert(&source, window.page_range);
        match tokio::time::timeout(options.window_timeout, call).await {
            Ok(Ok(converted)) => return WindowOutcome::Converted(converted),
            Ok(Err(error)) => last_error = error.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", options.window_timeout),
        }

        warn!(
            doc_id = %window.doc_id,
            window = window.window_index,
            attempt = attempt + 1,
            attempts,
            error = %last_error,
            "window conversion failed"
        );
    }

    WindowOutcome::Gap { reason: last_error }
}

/// Appends window results in index order onto one running text buffer.
struct DocumentMerger {
    result: ConversionResult,
    overlap_pages: u32,
    max_seam_chars: usize,
    last_page: Option<u32>,
    converted: usize,
    warnings: Vec<String>,
}

impl DocumentMerger {
    fn new(doc_id: &str, windowing: &WindowingOptions, options: &ConversionOptions) -> Self {
        Self {
            result: ConversionResult {
                doc_id: doc_id.to_string(),
                ..ConversionResult::default()
            },
            overlap_pages: windowing.overlap_pages,
            max_seam_chars: options.max_seam_chars,
            last_page: None,
            converted: 0,
            warnings: Vec::new(),
        }
    }

    fn merge(&mut self, window: &ConversionWindow, outcome: WindowOutcome) {
        let converted = match outcome {
            WindowOutcome::Converted(converted) => converted,
            WindowOutcome::Gap { reason } => {
                let pages = window
                    .page_range
                    .map(|range| range.to_string())
                    .unwrap_or_else(|| "all".to_string());
                self.warnings.push(format!(
                    "window {} (pages {pages}) left as a gap: {reason}",
                    window.window_index
                ));
                self.result.gaps.push(WindowGap {
                    window_index: window.window_index,
                    page_range: window.page_range,
                    reason,
                });
                return;
            }
        };
        self.converted += 1;

        let text = converted.plain_text;
        let page_map = sanitize_page_map(&text, converted.page_map);
        let cut = if self.overlap_pages > 0 && !self.result.plain_text.is_empty() {
            self.seam_cut(&text, &page_map)
        } else {
            0
        };

        let appended = &text[cut..];
        if appended.trim().is_empty() {
            debug!(window = window.window_index, "window added no new text");
            return;
        }

        if !self.result.plain_text.is_empty() {
            self.result.plain_text.push_str(SEAM_SEPARATOR);
        }
        let cursor = self.result.plain_text.len();
        self.result.plain_text.push_str(appended);

        for entry in page_map {
            if entry.end_offset <= cut {
                continue;
            }
            self.last_page = Some(self.last_page.map_or(entry.page_number, |last| last.max(entry.page_number)));
            self.result.page_map.push(PageMapEntry {
                page_number: entry.page_number,
                start_offset: entry.start_offset.max(cut) - cut + cursor,
                end_offset: entry.end_offset - cut + cursor,
            });
        }

        let text_len = text.len();
        self.result
            .heading_tree
            .extend(rebase_headings(converted.heading_tree, cut, cursor, text_len));
    }

    /// Bytes at the start of `text` that repeat what has already been merged.
    fn seam_cut(&self, text: &str, page_map: &[PageMapEntry]) -> usize {
        if let (Some(last_page), false) = (self.last_page, page_map.is_empty()) {
            let repeated_end = page_map
                .iter()
                .filter(|entry| entry.page_number <= last_page)
                .map(|entry| entry.end_offset)
                .max()
                .unwrap_or(0);
            let skipped_ws = text[repeated_end..].len() - text[repeated_end..].trim_start().len();
            return repeated_end + skipped_ws;
        }

        let merged = self.result.plain_text.as_str();
        let limit = self.max_seam_chars.min(text.len()).min(merged.len());
        let mut best = 0;
        for (boundary, _) in text
            .char_indices()
            .skip(1)
            .chain(std::iter::once((text.len(), ' ')))
        {
            if boundary > limit {
                break;
            }
            if boundary >= MIN_SEAM_MATCH_CHARS && merged.ends_with(&text[..boundary]) {
                best = boundary;
            }
        }
        best
    }

    fn finish(mut self, windows: usize) -> ConvertedDocument {
        if windows > 0 && self.converted == 0 {
            self.warnings.push(format!(
                "all {windows} conversion windows failed; document produced no text"
            ));
        }
        ConvertedDocument {
            result: self.result,
            windows,
            warnings: self.warnings,
        }
    }
}

/// Orders entries, clamps them to the text and removes overlaps so the merged
/// page map stays strictly increasing.
fn sanitize_page_map(text: &str, mut page_map: Vec<PageMapEntry>) -> Vec<PageMapEntry> {
    page_map.sort_by_key(|entry| (entry.start_offset, entry.page_number));
    let mut previous_end = 0usize;

    page_map
        .into_iter()
        .filter_map(|entry| {
            let start = floor_boundary(text, entry.start_offset).max(previous_end);
            let end = floor_boundary(text, entry.end_offset).max(start);
            if end == start && entry.end_offset > entry.start_offset {
                return None;
            }
            previous_end = end;
            Some(PageMapEntry {
                page_number: entry.page_number,
                start_offset: start,
                end_offset: end,
            })
        })
        .collect()
}

fn floor_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Drops headings inside the duplicated seam, promoting their surviving children,
/// and moves the rest to merged-text offsets.
fn rebase_headings(
    nodes: Vec<HeadingNode>,
    cut: usize,
    cursor: usize,
    text_len: usize,
) -> Vec<HeadingNode> {
    let mut rebased = Vec::new();
    for mut node in nodes {
        let children = rebase_headings(std::mem::take(&mut node.children), cut, cursor, text_len);
        if node.offset < cut {
            rebased.extend(children);
            continue;
        }
        node.offset = node.offset.min(text_len) - cut + cursor;
        node.children = children;
        rebased.push(node);
    }
    rebased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageRange;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn source() -> DocumentSource {
        DocumentSource {
            doc_id: "doc-1".to_string(),
            path: PathBuf::from("/tmp/doc-1.pdf"),
            title_hint: "doc-1".to_string(),
            citekey: None,
            checksum: "checksum".to_string(),
        }
    }

    fn fast_options() -> ConversionOptions {
        ConversionOptions {
            retry_delays: vec![Duration::ZERO, Duration::ZERO],
            window_timeout: Duration::from_secs(5),
            ..ConversionOptions::default()
        }
    }

    fn windowed(size: u32, overlap_pages: u32) -> WindowingOptions {
        WindowingOptions {
            window_size: size,
            force_windowed: true,
            overlap_pages,
            ..WindowingOptions::default()
        }
    }

    fn page_text(page: u32) -> String {
        format!("Page {page} body text.")
    }

    fn render(range: PageRange) -> ConvertedWindow {
        let mut text = String::new();
        let mut page_map = Vec::new();
        let mut headings = Vec::new();
        for page in range.start..=range.end {
            if !text.is_empty() {
                text.push('\n');
            }
            let start = text.len();
            headings.push(HeadingNode {
                level: 1,
                title: format!("Page {page}"),
                page_anchor: page,
                offset: start,
                children: Vec::new(),
            });
            text.push_str(&page_text(page));
            page_map.push(PageMapEntry {
                page_number: page,
                start_offset: start,
                end_offset: text.len(),
            });
        }
        ConvertedWindow {
            plain_text: text,
            page_map,
            heading_tree: headings,
        }
    }

    /// Later windows finish first so the merge has to reorder them.
    struct ReversedLatencyConverter {
        pages: u32,
        failing_windows: HashSet<u32>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Converter for ReversedLatencyConverter {
        async fn convert(
            &self,
            _source: &DocumentSource,
            pages: Option<PageRange>,
        ) -> Result<ConvertedWindow, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let range = pages.unwrap_or(PageRange::new(1, self.pages));
            if self.failing_windows.contains(&range.start) {
                return Err(ConversionError::InvalidResponse("layout engine crashed".to_string()));
            }
            let delay = u64::from(self.pages - range.start) * 5;
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(render(range))
        }

        async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
            Ok(Some(self.pages))
        }
    }

    #[tokio::test]
    async fn windows_merge_in_index_order_despite_completion_order() {
        let converter = Arc::new(ReversedLatencyConverter {
            pages: 12,
            failing_windows: HashSet::new(),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(converter, windowed(2, 0), fast_options());

        let converted = orchestrator.convert_document(&source()).await;
        let result = converted.result;

        assert_eq!(converted.windows, 6);
        assert!(converted.warnings.is_empty());
        let pages: Vec<u32> = result.page_map.iter().map(|entry| entry.page_number).collect();
        assert_eq!(pages, (1..=12).collect::<Vec<_>>());
        assert!(result.page_map_is_monotonic());
        for entry in &result.page_map {
            assert_eq!(
                &result.plain_text[entry.start_offset..entry.end_offset],
                page_text(entry.page_number)
            );
        }
        let anchors: Vec<u32> = result.heading_tree.iter().map(|node| node.page_anchor).collect();
        assert_eq!(anchors, (1..=12).collect::<Vec<_>>());
        assert!(result
            .heading_tree
            .iter()
            .all(|node| result.plain_text[node.offset..].starts_with(&node.title)));
    }

    #[tokio::test]
    async fn failing_window_becomes_a_gap_after_retries() {
        let converter = Arc::new(ReversedLatencyConverter {
            pages: 6,
            failing_windows: HashSet::from([3]),
            calls: AtomicUsize::new(0),
        });
        let orchestrator =
            ConversionOrchestrator::new(converter.clone(), windowed(2, 0), fast_options());

        let converted = orchestrator.convert_document(&source()).await;

        assert_eq!(converter.calls.load(Ordering::SeqCst), 2 + 3);
        assert_eq!(converted.result.gaps.len(), 1);
        assert_eq!(converted.result.gaps[0].window_index, 1);
        assert_eq!(converted.warnings.len(), 1);
        let pages: Vec<u32> = converted.result.page_map.iter().map(|e| e.page_number).collect();
        assert_eq!(pages, vec![1, 2, 5, 6]);
        assert!(converted.result.page_map_is_monotonic());
    }

    #[tokio::test]
    async fn all_failed_windows_yield_empty_result_with_warning() {
        let converter = Arc::new(ReversedLatencyConverter {
            pages: 4,
            failing_windows: HashSet::from([1, 3]),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(converter, windowed(2, 0), fast_options());

        let converted = orchestrator.convert_document(&source()).await;

        assert!(converted.result.is_empty());
        assert_eq!(converted.result.gaps.len(), 2);
        assert!(converted
            .warnings
            .iter()
            .any(|warning| warning.contains("all 2 conversion windows failed")));
    }

    #[tokio::test]
    async fn overlapping_pages_are_merged_once() {
        let converter = Arc::new(ReversedLatencyConverter {
            pages: 10,
            failing_windows: HashSet::new(),
            calls: AtomicUsize::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(converter, windowed(4, 1), fast_options());

        let result = orchestrator.convert_document(&source()).await.result;

        let pages: Vec<u32> = result.page_map.iter().map(|entry| entry.page_number).collect();
        assert_eq!(pages, (1..=10).collect::<Vec<_>>());
        assert_eq!(result.plain_text.matches("Page 4 body text.").count(), 1);
        assert_eq!(result.heading_tree.len(), 10);
        assert!(result.page_map_is_monotonic());
    }

    struct FlakyConverter {
        failures_left: Mutex<usize>,
    }

    #[async_trait]
    impl Converter for FlakyConverter {
        async fn convert(
            &self,
            _source: &DocumentSource,
            pages: Option<PageRange>,
        ) -> Result<ConvertedWindow, ConversionError> {
            let mut failures = self.failures_left.lock().expect("lock");
            if *failures > 0 {
                *failures -= 1;
                return Err(ConversionError::Timeout(Duration::from_secs(1)));
            }
            Ok(render(pages.unwrap_or(PageRange::new(1, 1))))
        }

        async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
            Ok(Some(3))
        }
    }

    #[tokio::test]
    async fn transient_failure_recovers_on_retry() {
        let converter = Arc::new(FlakyConverter {
            failures_left: Mutex::new(2),
        });
        let orchestrator =
            ConversionOrchestrator::new(converter, WindowingOptions::default(), fast_options());

        let converted = orchestrator.convert_document(&source()).await;

        assert!(converted.result.gaps.is_empty());
        assert_eq!(converted.result.page_map.len(), 3);
    }

    /// Page count unknown until the whole-document call has failed.
    struct UnboundedTimeoutConverter {
        probes: AtomicUsize,
    }

    #[async_trait]
    impl Converter for UnboundedTimeoutConverter {
        async fn convert(
            &self,
            _source: &DocumentSource,
            pages: Option<PageRange>,
        ) -> Result<ConvertedWindow, ConversionError> {
            match pages {
                None => Err(ConversionError::Timeout(Duration::from_secs(120))),
                Some(range) => Ok(render(range)),
            }
        }

        async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
            let probe = self.probes.fetch_add(1, Ordering::SeqCst);
            Ok((probe > 0).then_some(25))
        }
    }

    #[tokio::test]
    async fn unbounded_window_falls_back_to_fixed_windows() {
        let converter = Arc::new(UnboundedTimeoutConverter {
            probes: AtomicUsize::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(
            converter,
            WindowingOptions::default(),
            fast_options(),
        );

        let converted = orchestrator.convert_document(&source()).await;

        assert_eq!(converted.windows, 3);
        assert!(converted.result.gaps.is_empty());
        assert_eq!(converted.result.page_map.len(), 25);
    }

    /// A file the parser rejects outright.
    struct CorruptConverter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Converter for CorruptConverter {
        async fn convert(
            &self,
            _source: &DocumentSource,
            _pages: Option<PageRange>,
        ) -> Result<ConvertedWindow, ConversionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(ConversionError::PdfParse("invalid file header".to_string()))
        }

        async fn page_count(&self, _source: &DocumentSource) -> Result<Option<u32>, ConversionError> {
            Err(ConversionError::PdfParse("invalid file header".to_string()))
        }
    }

    #[tokio::test]
    async fn unreadable_document_is_reported_without_converting() {
        let converter = Arc::new(CorruptConverter {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = ConversionOrchestrator::new(
            converter.clone(),
            WindowingOptions::default(),
            fast_options(),
        );

        let converted = orchestrator.convert_document(&source()).await;

        assert_eq!(converter.calls.load(Ordering::SeqCst), 0);
        assert!(converted.result.is_empty());
        assert_eq!(converted.result.gaps.len(), 1);
        assert!(converted
            .warnings
            .iter()
            .any(|warning| warning.contains("unreadable document") && warning.contains("invalid file header")));
    }

    #[test]
    fn text_seam_overlap_is_dropped_without_page_map() {
        let windowing = WindowingOptions {
            overlap_pages: 1,
            ..WindowingOptions::default()
        };
        let mut merger = DocumentMerger::new("doc", &windowing, &ConversionOptions::default());
        let window = |index| ConversionWindow {
            doc_id: "doc".to_string(),
            window_index: index,
            page_range: None,
        };
        let shared = "the trailing paragraph that both windows contain verbatim.";

        merger.merge(
            &window(0),
            WindowOutcome::Converted(ConvertedWindow {
                plain_text: format!("Opening words. {shared}"),
                ..ConvertedWindow::default()
            }),
        );
        merger.merge(
            &window(1),
            WindowOutcome::Converted(ConvertedWindow {
                plain_text: format!("{shared} Closing words."),
                ..ConvertedWindow::default()
            }),
        );

        let merged = merger.finish(2).result.plain_text;
        assert_eq!(merged.matches(shared).count(), 1);
        assert!(merged.ends_with("Closing words."));
    }

    #[test]
    fn overlapping_converter_offsets_are_sanitized() {
        let text = "abcdefghij";
        let sanitized = sanitize_page_map(
            text,
            vec![
                PageMapEntry {
                    page_number: 2,
                    start_offset: 4,
                    end_offset: 40,
                },
                PageMapEntry {
                    page_number: 1,
                    start_offset: 0,
                    end_offset: 6,
                },
            ],
        );

        assert_eq!(sanitized[0].page_number, 1);
        assert_eq!(sanitized[1].start_offset, 6);
        assert_eq!(sanitized[1].end_offset, 10);
    }
}
