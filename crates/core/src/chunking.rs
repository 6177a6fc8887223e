use crate::error::IngestError;
use crate::models::{PipelineConfig, MARKDOWN_SEPARATORS};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct SplitterConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub separators: Vec<String>,
}

impl Default for SplitterConfig {
    fn default() -> Self {
        PipelineConfig::default().into()
    }
}

impl From<PipelineConfig> for SplitterConfig {
    fn from(value: PipelineConfig) -> Self {
        Self {
            chunk_size: value.chunk_size,
            chunk_overlap: value.chunk_overlap,
            separators: MARKDOWN_SEPARATORS.iter().map(|sep| sep.to_string()).collect(),
        }
    }
}

/// Splits text on the first separator it contains, merges the pieces back up
/// to `chunk_size` chars and recurses with the remaining separators on any
/// piece that is still too large.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    config: SplitterConfig,
}

impl RecursiveSplitter {
    pub fn new(config: SplitterConfig) -> Result<Self, IngestError> {
        if config.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be positive".to_string(),
            ));
        }
        if config.chunk_overlap >= config.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                config.chunk_overlap, config.chunk_size
            )));
        }
        if config.separators.iter().any(String::is_empty) {
            return Err(IngestError::InvalidChunkConfig(
                "separators must not be empty strings".to_string(),
            ));
        }

        Ok(Self { config })
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &self.config.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        let mut separator = separators.last().map(String::as_str).unwrap_or("\n\n");
        let mut remaining: &[String] = &[];
        for (position, candidate) in separators.iter().enumerate() {
            if text.contains(candidate.as_str()) {
                separator = candidate;
                remaining = &separators[position + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut fitting = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(piece) < self.config.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge_pieces(&fitting));
                fitting.clear();
            }

            if remaining.is_empty() {
                let trimmed = piece.trim();
                if !trimmed.is_empty() {
                    chunks.push(trimmed.to_string());
                }
            } else {
                chunks.extend(self.split_recursive(piece, remaining));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge_pieces(&fitting));
        }

        chunks
    }

    fn merge_pieces(&self, pieces: &[&str]) -> Vec<String> {
        let size = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut merged = Vec::new();
        let mut window: Vec<&str> = Vec::new();
        let mut window_len = 0usize;
        let mut head = 0usize;

        for piece in pieces {
            let piece_len = char_len(piece);

            if window_len + piece_len > size {
                if window_len > size {
                    warn!(chunk_len = window_len, chunk_size = size, "created oversized chunk");
                }

                if head < window.len() {
                    push_joined(&mut merged, &window[head..]);

                    while head < window.len()
                        && (window_len > overlap || window_len + piece_len > size)
                    {
                        window_len -= char_len(window[head]);
                        head += 1;
                    }
                }
            }

            window.push(piece);
            window_len += piece_len;
        }

        if head < window.len() {
            push_joined(&mut merged, &window[head..]);
        }

        merged
    }
}

fn push_joined(target: &mut Vec<String>, pieces: &[&str]) {
    let joined = pieces.concat();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        target.push(trimmed.to_string());
    }
}

/// Splits on `separator`, attaching each separator to the start of the piece
/// that follows it. Empty pieces are dropped.
fn split_keeping_separator<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0usize;

    for (offset, _) in text.match_indices(separator) {
        if offset > start {
            pieces.push(&text[start..offset]);
        }
        start = offset;
    }

    if start < text.len() {
        pieces.push(&text[start..]);
    }

    pieces
        .into_iter()
        .filter(|piece| !piece.is_empty())
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
