use crate::models::{ConversionWindow, PageRange};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WindowingOptions {
    pub window_size: u32,
    pub force_windowed: bool,
    /// Documents with fewer pages than this convert in a single call.
    pub threshold_pages: u32,
    /// Trailing pages of window `i` repeated at the start of window `i + 1`.
    pub overlap_pages: u32,
}

impl Default for WindowingOptions {
    fn default() -> Self {
        Self {
            window_size: 10,
            force_windowed: false,
            threshold_pages: 1_000,
            overlap_pages: 0,
        }
    }
}

/// Splits a document into ordered conversion windows covering every page.
pub fn plan_windows(
    doc_id: &str,
    page_count: Option<u32>,
    options: &WindowingOptions,
) -> Vec<ConversionWindow> {
    let Some(page_count) = page_count else {
        return vec![ConversionWindow {
            doc_id: doc_id.to_string(),
            window_index: 0,
            page_range: None,
        }];
    };

    if page_count == 0 {
        return Vec::new();
    }

    if page_count < options.threshold_pages && !options.force_windowed {
        return vec![ConversionWindow {
            doc_id: doc_id.to_string(),
            window_index: 0,
            page_range: Some(PageRange::new(1, page_count)),
        }];
    }

    let size = options.window_size.max(1);
    let mut windows = Vec::new();
    let mut first_page = 1u32;

    while first_page <= page_count {
        let last_page = first_page.saturating_add(size - 1).min(page_count);
        let start = if windows.is_empty() {
            first_page
        } else {
            first_page.saturating_sub(options.overlap_pages).max(1)
        };

        windows.push(ConversionWindow {
            doc_id: doc_id.to_string(),
            window_index: windows.len(),
            page_range: Some(PageRange::new(start, last_page)),
        });

        first_page = match last_page.checked_add(1) {
            Some(next) => next,
            None => break,
        };
    }

    windows
}
