pub mod bm25;
pub mod chunking;
pub mod convert;
pub mod embeddings;
pub mod error;
pub mod extractor;
#[cfg(test)]
mod fixtures;
pub mod ingest;
pub mod models;
pub mod preprocess;
pub mod search;
pub mod store;
pub mod summarize;
pub mod tfidf;
pub mod vector_index;

pub use bm25::{word_tokenize, Bm25Index};
pub use chunking::{RecursiveSplitter, SplitterConfig};
pub use convert::{ExportFormat, ParseReport, ParserOptions, PdfParser, ALL_EXPORT_FORMATS};
pub use embeddings::{
    EmbeddingEndpointConfig, Embedder, HashedNgramEmbedder, HttpEmbedder,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
pub use error::{IngestError, SearchError, SummarizeError};
pub use extractor::{extract_page_texts, OcrEndpointConfig, OcrEngine, PageText, PdfExtractor};
pub use ingest::{
    digest_file, discover_pdf_files, ingest_folder, IngestionReport, PdfProcessingPipeline,
    PipelineReport, SkippedPdf,
};
pub use models::{
    ChunkMetadata, FusionWeights, PipelineConfig, SearchHit, SignalScores, DEFAULT_CHUNK_OVERLAP,
    DEFAULT_CHUNK_SIZE, DEFAULT_TOP_K,
};
pub use preprocess::{normalize_whitespace, text_preprocessor, TextPreprocessor};
pub use search::{normalize_scores, HybridSearchEngine};
pub use store::{load_aligned, save_metadata, store_in_index, StoreReport};
pub use summarize::{
    ExtractiveSummaryModel, HttpSummaryModel, MedicalReportSummarizer, ReportSummary,
    SummaryEndpointConfig, SummaryModel,
};
pub use tfidf::{TfidfConfig, TfidfIndex};
pub use vector_index::FlatL2Index;
