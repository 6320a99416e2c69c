use crate::error::IngestError;
use crate::models::{Chunk, ChunkingPolicy, ConversionResult, HeadingNode, PageMapEntry, PageSpan};
use crate::tokenizer::{tokenizer_for, Tokenizer};
use sha2::{Digest, Sha256};
use tracing::debug;

const CHUNK_ID_HEX_LEN: usize = 32;
const STANDARD_PUNCTUATION: &str = ".,;:!?'\"()-[]/%&";

pub fn normalize_whitespace(text: &str) -> String {
    text.replace('\u{a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Share of non-whitespace characters that are letters, digits or standard
/// punctuation. Monotonic in the number of content characters; 0.0 for blank text.
pub fn signal_to_noise(text: &str) -> f32 {
    let mut total = 0usize;
    let mut content = 0usize;

    for character in text.chars().filter(|character| !character.is_whitespace()) {
        total += 1;
        if character.is_alphanumeric() || STANDARD_PUNCTUATION.contains(character) {
            content += 1;
        }
    }

    if total == 0 {
        0.0
    } else {
        content as f32 / total as f32
    }
}

pub fn make_chunk_id(doc_id: &str, anchor: &str, embedding_model_id: &str, chunk_idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(doc_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(anchor.as_bytes());
    hasher.update([0x1f]);
    hasher.update(embedding_model_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(chunk_idx.to_le_bytes());
    let mut id = format!("{:x}", hasher.finalize());
    id.truncate(CHUNK_ID_HEX_LEN);
    id
}

#[derive(Debug, Clone, Default)]
pub struct ChunkingOutcome {
    pub chunks: Vec<Chunk>,
    pub filtered: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Section {
    start: usize,
    end: usize,
    path: Vec<String>,
}

pub struct Chunker {
    policy: ChunkingPolicy,
    tokenizer: Box<dyn Tokenizer>,
}

impl Chunker {
    pub fn new(policy: ChunkingPolicy) -> Result<Self, IngestError> {
        if policy.max_tokens == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "max_tokens must be positive".to_string(),
            ));
        }
        if policy.overlap_tokens >= policy.max_tokens {
            return Err(IngestError::InvalidChunkConfig(format!(
                "overlap_tokens {} must be smaller than max_tokens {}",
                policy.overlap_tokens, policy.max_tokens
            )));
        }
        if !(0.0..=1.0).contains(&policy.min_signal_to_noise) {
            return Err(IngestError::InvalidChunkConfig(format!(
                "min_signal_to_noise {} is outside 0..=1",
                policy.min_signal_to_noise
            )));
        }

        let tokenizer = tokenizer_for(&policy.tokenizer_id)?;
        Ok(Self { policy, tokenizer })
    }

    pub fn policy(&self) -> &ChunkingPolicy {
        &self.policy
    }

    /// Chunk sizes are only meaningful if the embedding model tokenizes the same way.
    pub fn ensure_aligned(&self, model_id: &str, model_family: &str) -> Result<(), IngestError> {
        if self.tokenizer.family() == model_family {
            return Ok(());
        }
        Err(IngestError::TokenizerMismatch {
            tokenizer: self.tokenizer.id().to_string(),
            tokenizer_family: self.tokenizer.family().to_string(),
            model_id: model_id.to_string(),
            model_family: model_family.to_string(),
        })
    }

    pub fn chunk(&self, document: &ConversionResult, embedding_model_id: &str) -> ChunkingOutcome {
        let text = document.plain_text.as_str();
        let heading_context = usize::from(self.policy.heading_context.clamp(1, 2));
        let mut outcome = ChunkingOutcome::default();
        let mut chunk_idx = 0u64;

        for section in split_sections(text, &document.heading_tree) {
            let body = &text[section.start..section.end];
            let spans = self.tokenizer.token_spans(body);
            if spans.is_empty() {
                continue;
            }

            let mut first = 0usize;
            loop {
                let last = (first + self.policy.max_tokens).min(spans.len());
                let start = section.start + spans[first].0;
                let end = section.start + spans[last - 1].1;
                let chunk_text = &text[start..end];
                let token_count = last - first;
                let quality = signal_to_noise(chunk_text);

                if token_count < self.policy.min_chunk_length
                    || quality < self.policy.min_signal_to_noise
                {
                    outcome.filtered += 1;
                } else {
                    let page_span = page_span_for(&document.page_map, start, end);
                    let anchor = if document.page_map.is_empty() {
                        section.path.join("/")
                    } else {
                        format!("p{}-{}", page_span.start, page_span.end)
                    };
                    let context = &section.path[section.path.len().saturating_sub(heading_context)..];

                    outcome.chunks.push(Chunk {
                        id: make_chunk_id(&document.doc_id, &anchor, embedding_model_id, chunk_idx),
                        doc_id: document.doc_id.clone(),
                        text: chunk_text.to_string(),
                        context_prefix: (!context.is_empty()).then(|| context.join(" > ")),
                        page_span,
                        section_heading: section.path.last().cloned(),
                        section_path: section.path.clone(),
                        chunk_idx,
                        token_count,
                        signal_to_noise: quality,
                        citation: None,
                    });
                    chunk_idx += 1;
                }

                if last == spans.len() {
                    break;
                }
                first = last
                    .saturating_sub(self.policy.overlap_tokens)
                    .max(first + 1);
            }
        }

        debug!(
            doc_id = %document.doc_id,
            kept = outcome.chunks.len(),
            filtered = outcome.filtered,
            "chunked document"
        );

        outcome
    }
}

/// Cuts the text at every heading offset. Section paths come from a level stack
/// over the headings in document order, so fragments appended as siblings by the
/// window merge still nest under the last shallower heading.
fn split_sections(text: &str, headings: &[HeadingNode]) -> Vec<Section> {
    let mut flat = Vec::new();
    flatten_headings(headings, &mut flat);
    flat.sort_by_key(|heading| heading.offset);

    let mut sections = Vec::new();
    let mut stack: Vec<(u8, String)> = Vec::new();
    let first_offset = flat
        .first()
        .map(|heading| clamp_offset(text, heading.offset))
        .unwrap_or(text.len());

    if first_offset > 0 {
        sections.push(Section {
            start: 0,
            end: first_offset,
            path: Vec::new(),
        });
    }

    for (position, heading) in flat.iter().enumerate() {
        while stack.last().is_some_and(|(level, _)| *level >= heading.level) {
            stack.pop();
        }
        stack.push((heading.level, normalize_whitespace(&heading.title)));

        let offset = clamp_offset(text, heading.offset);
        let end = flat
            .get(position + 1)
            .map(|next| clamp_offset(text, next.offset))
            .unwrap_or(text.len())
            .max(offset);
        let start = skip_heading_line(text, offset, end, &heading.title);

        sections.push(Section {
            start,
            end,
            path: stack.iter().map(|(_, title)| title.clone()).collect(),
        });
    }

    sections
}

fn flatten_headings<'a>(nodes: &'a [HeadingNode], out: &mut Vec<&'a HeadingNode>) {
    for node in nodes {
        out.push(node);
        flatten_headings(&node.children, out);
    }
}

fn clamp_offset(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Steps past the heading's own line when the text at `offset` is the heading title.
fn skip_heading_line(text: &str, offset: usize, end: usize, title: &str) -> usize {
    let region = &text[offset..end];
    let line_end = region.find('\n').map(|index| index + 1).unwrap_or(region.len());
    let line = normalize_whitespace(&region[..line_end]);
    let title = normalize_whitespace(title);

    if !title.is_empty() && line.contains(&title) {
        offset + line_end
    } else {
        offset
    }
}

fn page_span_for(page_map: &[PageMapEntry], start: usize, end: usize) -> PageSpan {
    let touched: Vec<u32> = page_map
        .iter()
        .filter(|entry| entry.start_offset < end && entry.end_offset > start)
        .map(|entry| entry.page_number)
        .collect();

    match (touched.iter().min(), touched.iter().max()) {
        (Some(first), Some(last)) => PageSpan {
            start: *first,
            end: *last,
        },
        _ => {
            let page = page_map
                .iter()
                .rev()
                .find(|entry| entry.start_offset <= start)
                .or_else(|| page_map.first())
                .map(|entry| entry.page_number)
                .unwrap_or(0);
            PageSpan {
                start: page,
                end: page,
            }
        }
    }
}
