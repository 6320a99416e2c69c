use crate::error::IngestError;
use regex::Regex;

/// Locates tokens. Spans are byte ranges into the input.
pub trait Tokenizer: Send + Sync {
    fn id(&self) -> &str;

    /// Tokenizers in the same family size text identically; an embedding model
    /// declares the family it was trained with.
    fn family(&self) -> &str;

    fn token_spans(&self, text: &str) -> Vec<(usize, usize)>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WhitespaceTokenizer;

impl Tokenizer for WhitespaceTokenizer {
    fn id(&self) -> &str {
        "whitespace"
    }

    fn family(&self) -> &str {
        "whitespace"
    }

    fn token_spans(&self, text: &str) -> Vec<(usize, usize)> {
        let mut spans = Vec::new();
        let mut start = None;

        for (index, character) in text.char_indices() {
            match (character.is_whitespace(), start) {
                (true, Some(begin)) => {
                    spans.push((begin, index));
                    start = None;
                }
                (false, None) => start = Some(index),
                _ => {}
            }
        }

        if let Some(begin) = start {
            spans.push((begin, text.len()));
        }

        spans
    }
}

/// Words and individual punctuation marks, the way most subword vocabularies
/// pre-split text before merging.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    pattern: Regex,
}

impl WordTokenizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(r"\w+|[^\w\s]")?,
        })
    }
}

impl Tokenizer for WordTokenizer {
    fn id(&self) -> &str {
        "word"
    }

    fn family(&self) -> &str {
        "word"
    }

    fn token_spans(&self, text: &str) -> Vec<(usize, usize)> {
        self.pattern
            .find_iter(text)
            .map(|found| (found.start(), found.end()))
            .collect()
    }
}

pub fn tokenizer_for(tokenizer_id: &str) -> Result<Box<dyn Tokenizer>, IngestError> {
    match tokenizer_id {
        "whitespace" => Ok(Box::new(WhitespaceTokenizer)),
        "word" => {
            let tokenizer = WordTokenizer::new()
                .map_err(|error| IngestError::InvalidChunkConfig(error.to_string()))?;
            Ok(Box::new(tokenizer))
        }
        other => Err(IngestError::InvalidChunkConfig(format!(
            "unknown tokenizer `{other}`"
        ))),
    }
}
