use crate::chunking::{RecursiveSplitter, SplitterConfig};
use crate::convert::{ParserOptions, PdfParser};
use crate::embeddings::Embedder;
use crate::error::IngestError;
use crate::extractor::OcrEngine;
use crate::models::PipelineConfig;
use crate::preprocess::TextPreprocessor;
use crate::store::{save_metadata, store_in_index, StoreReport};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

const PREVIEW_CHARS: usize = 500;

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

/// Index name derived from the PDF file stem: `reports/PEREZ.pdf` -> `PEREZ`.
pub fn index_name_for(path: &Path) -> Result<String, IngestError> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
        .ok_or_else(|| IngestError::MissingFileName(path.display().to_string()))
}

#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub pdf_path: PathBuf,
    pub index_name: String,
    pub chunk_count: usize,
    pub store: StoreReport,
    pub metadata_path: PathBuf,
    pub export_paths: BTreeMap<String, PathBuf>,
    pub elapsed: Duration,
}

/// Parse -> preprocess -> split -> embed -> store for a single PDF.
pub struct PdfProcessingPipeline<'a, E: Embedder + ?Sized> {
    pdf_path: PathBuf,
    index_name: String,
    config: PipelineConfig,
    parser: PdfParser,
    preprocessor: TextPreprocessor,
    splitter: RecursiveSplitter,
    embedder: &'a E,
}

impl<'a, E: Embedder + ?Sized> PdfProcessingPipeline<'a, E> {
    /// `index_name` defaults to the PDF's file stem.
    pub fn new(
        pdf_path: impl Into<PathBuf>,
        index_name: Option<String>,
        config: PipelineConfig,
        ocr_engine: OcrEngine,
        embedder: &'a E,
    ) -> Result<Self, IngestError> {
        let pdf_path = pdf_path.into();
        let index_name = match index_name {
            Some(name) if !name.trim().is_empty() => name,
            _ => index_name_for(&pdf_path)?,
        };

        info!(pdf = %pdf_path.display(), index_name = %index_name, "initializing pdf pipeline");

        let parser = PdfParser::new(ParserOptions {
            ocr_engine,
            detect_headings: true,
            output_dir: config.output_dir.clone(),
        })?;
        let splitter = RecursiveSplitter::new(SplitterConfig::from(config.clone()))?;

        Ok(Self {
            pdf_path,
            index_name,
            config,
            parser,
            preprocessor: TextPreprocessor::new()?,
            splitter,
            embedder,
        })
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    /// Converts the PDF to markdown, writing the `.md` export alongside.
    pub fn parse_pdf(&self) -> Result<(String, BTreeMap<String, PathBuf>), IngestError> {
        let report = self.parser.parse_pdf(&self.pdf_path, &["md"])?;
        info!(
            seconds = report.processing_time.as_secs_f64(),
            exports = ?report.export_paths,
            "parsing completed"
        );
        debug!(
            preview = %report.content.chars().take(PREVIEW_CHARS).collect::<String>(),
            "parsed content"
        );
        Ok((report.content, report.export_paths))
    }

    pub fn process_text(&self, text: &str) -> Vec<String> {
        let cleaned = self.preprocessor.clean(text);
        let chunks = self.splitter.split_text(&cleaned);
        info!(chunk_count = chunks.len(), "text split into chunks");
        match chunks.first() {
            Some(first) => debug!(first_chunk = %first, "first chunk"),
            None => warn!(pdf = %self.pdf_path.display(), "no chunks generated"),
        }
        chunks
    }

    pub fn store_embeddings(&self, chunks: &[String]) -> Result<StoreReport, IngestError> {
        let report = store_in_index(
            &self.config.vector_db_dir,
            &self.index_name,
            self.embedder,
            chunks,
        )?;
        Ok(report)
    }

    pub fn run_pipeline(&self) -> Result<PipelineReport, IngestError> {
        let started = Instant::now();
        info!(pdf = %self.pdf_path.display(), "pipeline execution started");

        let (content, export_paths) = self.parse_pdf()?;
        let chunks = self.process_text(&content);
        let store = self.store_embeddings(&chunks)?;

        let checksum = digest_file(&self.pdf_path)?;
        let metadata_path = save_metadata(
            &self.index_name,
            &chunks,
            &self.config.output_dir,
            Some(checksum),
        )?;

        let elapsed = started.elapsed();
        info!(
            index_name = %self.index_name,
            chunk_count = chunks.len(),
            seconds = elapsed.as_secs_f64(),
            "pipeline finished"
        );

        Ok(PipelineReport {
            pdf_path: self.pdf_path.clone(),
            index_name: self.index_name.clone(),
            chunk_count: chunks.len(),
            store,
            metadata_path,
            export_paths,
            elapsed,
        })
    }
}

#[derive(Debug, Clone)]
pub struct SkippedPdf {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct IngestionReport {
    pub ingested: Vec<PipelineReport>,
    pub skipped_files: Vec<SkippedPdf>,
}

/// Runs the pipeline for every PDF under `folder`, one index per file stem.
/// Files that fail are recorded as skipped; a folder without PDFs is an error.
pub fn ingest_folder<E: Embedder + ?Sized>(
    folder: &Path,
    config: &PipelineConfig,
    ocr_engine: &OcrEngine,
    embedder: &E,
) -> Result<IngestionReport, IngestError> {
    let files = discover_pdf_files(folder);

    if files.is_empty() {
        return Err(IngestError::InvalidArgument(format!(
            "no pdf files found in {}",
            folder.display()
        )));
    }

    let mut report = IngestionReport::default();

    for path in files {
        let outcome = PdfProcessingPipeline::new(
            path.clone(),
            None,
            config.clone(),
            ocr_engine.clone(),
            embedder,
        )
        .and_then(|pipeline| pipeline.run_pipeline());

        match outcome {
            Ok(ingested) => report.ingested.push(ingested),
            Err(error) => {
                warn!(path = %path.display(), %error, "skipping pdf");
                report.skipped_files.push(SkippedPdf {
                    path,
                    reason: error.to_string(),
                });
            }
        }
    }

    info!(
        ingested = report.ingested.len(),
        skipped = report.skipped_files.len(),
        "folder ingestion finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashedNgramEmbedder;
    use crate::fixtures::write_text_pdf;
    use crate::models::ChunkMetadata;
    use crate::search::HybridSearchEngine;
    use crate::store::{index_path, load_aligned, text_store_path};
    use std::fs::File;
    use std::io::Write;
    use tempfile::tempdir;

    fn config_in(base: &Path) -> PipelineConfig {
        PipelineConfig {
            vector_db_dir: base.join("vector_db"),
            output_dir: base.join("parsed_pdfs"),
            ..PipelineConfig::default()
        }
    }

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
        assert_eq!(
            first,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        Ok(())
    }

    #[test]
    fn index_name_defaults_to_file_stem() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = HashedNgramEmbedder::default();
        let pipeline = PdfProcessingPipeline::new(
            dir.path().join("PEREZ_RECORDS.pdf"),
            None,
            config_in(dir.path()),
            OcrEngine::None,
            &embedder,
        )?;
        assert_eq!(pipeline.index_name(), "PEREZ_RECORDS");
        assert!(!dir.path().join("parsed_pdfs").exists());
        Ok(())
    }

    #[test]
    fn processed_chunks_are_stored_aligned() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = config_in(dir.path());
        let embedder = HashedNgramEmbedder::default();
        let pipeline = PdfProcessingPipeline::new(
            dir.path().join("report.pdf"),
            Some("report".to_string()),
            config.clone(),
            OcrEngine::None,
            &embedder,
        )?;

        let markdown = (0..20)
            .map(|section| {
                format!("## Section {section}\nPatient reports stable vitals and no new complaints.")
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = pipeline.process_text(&markdown);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|chunk| chunk.chars().count() <= 500));

        let stored = pipeline.store_embeddings(&chunks)?;
        assert_eq!(stored.chunk_count, chunks.len());

        let (index, texts) = load_aligned(&config.vector_db_dir, "report")?;
        assert_eq!(index.len(), texts.len());
        assert_eq!(texts, chunks);
        Ok(())
    }

    #[test]
    fn pipeline_stores_index_texts_and_metadata() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let config = config_in(dir.path());
        let pdf = dir.path().join("PEREZ.pdf");
        write_text_pdf(
            &pdf,
            &["PAST MEDICAL HISTORY", "Hypertension since 2015.", "ASSESSMENT", "Stable angina."],
        )?;
        let embedder = HashedNgramEmbedder::default();

        let report =
            PdfProcessingPipeline::new(pdf.clone(), None, config.clone(), OcrEngine::None, &embedder)?
                .run_pipeline()?;

        assert_eq!(report.index_name, "PEREZ");
        assert!(report.chunk_count >= 1);
        assert_eq!(report.store.index_path, index_path(&config.vector_db_dir, "PEREZ"));
        assert!(text_store_path(&config.vector_db_dir, "PEREZ").is_file());
        assert_eq!(report.metadata_path, config.output_dir.join("PEREZ_metadata.json"));
        assert!(report.export_paths["md"].is_file());

        let metadata: ChunkMetadata =
            serde_json::from_str(&fs::read_to_string(&report.metadata_path)?)?;
        assert_eq!(metadata.num_chunks, report.chunk_count);
        assert_eq!(metadata.source_checksum, Some(digest_file(&pdf)?));

        let (index, texts) = load_aligned(&config.vector_db_dir, "PEREZ")?;
        assert_eq!(index.len(), report.chunk_count);
        assert_eq!(texts, metadata.chunks);

        let mut engine = HybridSearchEngine::open(&config.vector_db_dir, "PEREZ", embedder)?;
        let hits = engine.hybrid_search("hypertension", 1, None)?;
        assert!(hits[0].text.contains("Hypertension"));
        Ok(())
    }

    #[test]
    fn folder_ingest_builds_one_index_per_pdf() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let inbox = dir.path().join("inbox");
        fs::create_dir(&inbox)?;
        write_text_pdf(&inbox.join("first.pdf"), &["Chest pain at rest."])?;
        write_text_pdf(&inbox.join("second.pdf"), &["Blood test shows high cholesterol."])?;
        fs::write(inbox.join("broken.pdf"), b"%PDF-1.4\n%broken")?;
        let config = config_in(dir.path());
        let embedder = HashedNgramEmbedder::default();

        let report = ingest_folder(&inbox, &config, &OcrEngine::None, &embedder)?;

        let names = report
            .ingested
            .iter()
            .map(|ingested| ingested.index_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(report.skipped_files.len(), 1);
        assert!(index_path(&config.vector_db_dir, "second").is_file());
        Ok(())
    }

    #[test]
    fn ingestion_fails_without_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = HashedNgramEmbedder::default();
        let result = ingest_folder(
            dir.path(),
            &config_in(dir.path()),
            &OcrEngine::None,
            &embedder,
        );
        assert!(matches!(result, Err(IngestError::InvalidArgument(_))));
        Ok(())
    }

    #[test]
    fn best_effort_skips_unreadable_pdfs() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let inbox = dir.path().join("inbox");
        fs::create_dir(&inbox)?;
        fs::write(inbox.join("unreadable.pdf"), b"%PDF-1.4\n%broken")?;
        let embedder = HashedNgramEmbedder::default();

        let report = ingest_folder(&inbox, &config_in(dir.path()), &OcrEngine::None, &embedder)?;

        assert!(report.ingested.is_empty());
        assert_eq!(report.skipped_files.len(), 1);
        assert_eq!(
            report.skipped_files[0]
                .path
                .file_name()
                .and_then(|name| name.to_str()),
            Some("unreadable.pdf")
        );
        Ok(())
    }
}
