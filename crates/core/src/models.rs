use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const DEFAULT_CHUNK_OVERLAP: usize = 50;
pub const DEFAULT_TOP_K: usize = 5;

/// Markdown-aware separators, tried in order by the recursive splitter.
pub const MARKDOWN_SEPARATORS: [&str; 5] = ["\n# ", "\n## ", "\n### ", "\n- ", "\n\n"];

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub vector_db_dir: PathBuf,
    pub output_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vector_db_dir: PathBuf::from("vector_db"),
            output_dir: PathBuf::from("parsed_pdfs"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            top_k: DEFAULT_TOP_K,
        }
    }
}

/// Weights applied to the lexical (BM25), dense (vector) and sparse (TF-IDF) signals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct FusionWeights {
    pub lexical: f64,
    pub dense: f64,
    pub sparse: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            lexical: 0.3,
            dense: 0.4,
            sparse: 0.3,
        }
    }
}

impl FusionWeights {
    pub(crate) fn cache_bits(&self) -> [u64; 3] {
        [
            self.lexical.to_bits(),
            self.dense.to_bits(),
            self.sparse.to_bits(),
        ]
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalScores {
    pub lexical: f64,
    pub dense: f64,
    pub sparse: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    /// Position of the chunk in the text store.
    pub position: usize,
    pub text: String,
    pub score: f64,
    pub signals: SignalScores,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub num_chunks: usize,
    pub chunks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}
