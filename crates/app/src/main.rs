use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use medrag_core::store::load_text_store;
use medrag_core::{
    ingest_folder, Embedder, EmbeddingEndpointConfig, ExtractiveSummaryModel, FusionWeights,
    HashedNgramEmbedder, HttpEmbedder, HttpSummaryModel, HybridSearchEngine,
    MedicalReportSummarizer, OcrEndpointConfig, OcrEngine, ParserOptions, PdfParser,
    PdfProcessingPipeline, PipelineConfig, ReportSummary, SummaryEndpointConfig, SummaryModel,
    ALL_EXPORT_FORMATS, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE, DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "medrag", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Directory holding `<name>.index` and `<name>.json` pairs
    #[arg(long, env = "MEDRAG_VECTOR_DB", default_value = "vector_db", global = true)]
    vector_db_dir: PathBuf,

    /// Directory for converter exports and chunk metadata
    #[arg(long, default_value = "parsed_pdfs", global = true)]
    output_dir: PathBuf,

    /// Feature-extraction endpoint; the local hashed encoder is used when unset
    #[arg(long, env = "MEDRAG_EMBEDDING_ENDPOINT", global = true)]
    embedding_endpoint: Option<String>,

    #[arg(long, env = "MEDRAG_EMBEDDING_API_KEY", hide_env_values = true, global = true)]
    embedding_api_key: Option<String>,

    #[arg(long, default_value_t = DEFAULT_EMBEDDING_DIMENSIONS, global = true)]
    embedding_dimensions: usize,

    /// Summarization endpoint; the local extractive model is used when unset
    #[arg(long, env = "MEDRAG_SUMMARY_ENDPOINT", global = true)]
    summary_endpoint: Option<String>,

    #[arg(long, env = "MEDRAG_SUMMARY_API_KEY", hide_env_values = true, global = true)]
    summary_api_key: Option<String>,

    /// OCR endpoint used when a PDF has no extractable text
    #[arg(long, env = "MEDRAG_OCR_ENDPOINT", global = true)]
    ocr_endpoint: Option<String>,

    #[arg(long, env = "MEDRAG_OCR_API_KEY", hide_env_values = true, global = true)]
    ocr_api_key: Option<String>,

    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, global = true)]
    chunk_size: usize,

    #[arg(long, default_value_t = DEFAULT_CHUNK_OVERLAP, global = true)]
    chunk_overlap: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Convert a PDF into json, txt, md or doctags exports.
    Convert {
        #[arg(long)]
        input: PathBuf,
        /// Comma separated export formats.
        #[arg(long, value_delimiter = ',', default_value = "md")]
        formats: Vec<String>,
        /// Treat every line run as a paragraph.
        #[arg(long, default_value_t = false)]
        no_headings: bool,
    },
    /// Parse, chunk, embed and store one PDF.
    Ingest {
        #[arg(long)]
        pdf: PathBuf,
        /// Index name; defaults to the PDF file stem.
        #[arg(long)]
        index: Option<String>,
    },
    /// Ingest every PDF under a folder, one index per file.
    IngestFolder {
        #[arg(long)]
        folder: PathBuf,
    },
    /// Hybrid BM25, vector and TF-IDF search over a stored index.
    Search {
        #[arg(long)]
        index: String,
        #[arg(long)]
        query: String,
        #[arg(long, default_value_t = 5)]
        top_k: usize,
        /// Print the per-signal scores for each hit.
        #[arg(long, default_value_t = false)]
        explain: bool,
        #[command(flatten)]
        weights: WeightArgs,
    },
    /// Summarize a report file, or the stored chunks of an index.
    Summarize {
        #[arg(long, conflicts_with = "report", required_unless_present = "report")]
        index: Option<String>,
        /// Report to summarize: a PDF or a text file.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Focus areas for a focused summary of a report.
        #[arg(long, value_delimiter = ',')]
        focus: Vec<String>,
        #[arg(long, default_value_t = 150)]
        max_length: usize,
        #[arg(long, default_value_t = 50)]
        min_length: usize,
        /// Chunks per partial summary when summarizing an index.
        #[arg(long, default_value_t = 4)]
        batch_size: usize,
    },
}

#[derive(Args)]
struct WeightArgs {
    #[arg(long, default_value_t = 0.3)]
    lexical_weight: f64,
    #[arg(long, default_value_t = 0.4)]
    dense_weight: f64,
    #[arg(long, default_value_t = 0.3)]
    sparse_weight: f64,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            vector_db_dir: self.vector_db_dir.clone(),
            output_dir: self.output_dir.clone(),
            chunk_size: self.chunk_size,
            chunk_overlap: self.chunk_overlap,
            ..PipelineConfig::default()
        }
    }

    fn ocr_engine(&self) -> OcrEngine {
        match self.ocr_endpoint.as_deref().map(str::trim) {
            Some(endpoint) if !endpoint.is_empty() => OcrEngine::Remote(OcrEndpointConfig {
                endpoint: endpoint.to_string(),
                api_key: self.ocr_api_key.clone(),
            }),
            _ => OcrEndpointConfig::from_env()
                .map(OcrEngine::Remote)
                .unwrap_or_default(),
        }
    }

    fn embedder(&self) -> anyhow::Result<Box<dyn Embedder>> {
        match &self.embedding_endpoint {
            Some(endpoint) => {
                let embedder = HttpEmbedder::new(EmbeddingEndpointConfig {
                    endpoint: endpoint.clone(),
                    api_key: self.embedding_api_key.clone(),
                    dimensions: self.embedding_dimensions,
                })
                .context("invalid embedding endpoint")?;
                Ok(Box::new(embedder))
            }
            None => Ok(Box::new(HashedNgramEmbedder {
                dimensions: self.embedding_dimensions,
            })),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "medrag boot"
    );

    match &cli.command {
        Command::Convert {
            input,
            formats,
            no_headings,
        } => {
            for name in formats {
                if !ALL_EXPORT_FORMATS.contains(&name.trim().to_ascii_lowercase().as_str()) {
                    warn!(format = %name, supported = ?ALL_EXPORT_FORMATS, "unsupported export format");
                }
            }

            let parser = PdfParser::new(ParserOptions {
                ocr_engine: cli.ocr_engine(),
                detect_headings: !no_headings,
                output_dir: cli.output_dir.clone(),
            })?;
            let formats = formats.iter().map(String::as_str).collect::<Vec<_>>();
            let report = parser.parse_pdf(input, &formats)?;

            println!(
                "converted {} in {:.2}s (ocr={}, structure={})",
                report.document_name,
                report.processing_time.as_secs_f64(),
                report.ocr_enabled,
                report.structure_enabled
            );
            for (format, path) in &report.export_paths {
                println!("  {format}: {}", path.display());
            }
        }
        Command::Ingest { pdf, index } => {
            let embedder = cli.embedder()?;
            let pipeline = PdfProcessingPipeline::new(
                pdf.clone(),
                index.clone(),
                cli.pipeline_config(),
                cli.ocr_engine(),
                embedder.as_ref(),
            )?;
            let report = pipeline.run_pipeline()?;

            println!(
                "{} chunks stored in index '{}' ({}) in {:.2}s",
                report.chunk_count,
                report.index_name,
                report.store.index_path.display(),
                report.elapsed.as_secs_f64()
            );
        }
        Command::IngestFolder { folder } => {
            let embedder = cli.embedder()?;
            let report = ingest_folder(
                folder,
                &cli.pipeline_config(),
                &cli.ocr_engine(),
                embedder.as_ref(),
            )?;

            for skipped in &report.skipped_files {
                warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped pdf");
            }
            if report.ingested.is_empty() {
                println!("0 documents ingested (all files were skipped)");
            }
            for ingested in &report.ingested {
                println!(
                    "{}: {} chunks -> index '{}'",
                    ingested.pdf_path.display(),
                    ingested.chunk_count,
                    ingested.index_name
                );
            }
        }
        Command::Search {
            index,
            query,
            top_k,
            explain,
            weights,
        } => {
            let weights = FusionWeights {
                lexical: weights.lexical_weight,
                dense: weights.dense_weight,
                sparse: weights.sparse_weight,
            };
            let mut engine = HybridSearchEngine::open(&cli.vector_db_dir, index, cli.embedder()?)
                .with_context(|| format!("failed to open index '{index}'"))?;
            let hits = engine.hybrid_search(query, *top_k, Some(weights))?;

            println!("query: {query}");
            for (rank, hit) in hits.iter().enumerate() {
                println!("Rank {}: Score: {:.4}\n{}\n", rank + 1, hit.score, hit.text);
                if *explain {
                    println!(
                        "  explain: position={} bm25={:.4} dense={:.4} tfidf={:.4}",
                        hit.position, hit.signals.lexical, hit.signals.dense, hit.signals.sparse
                    );
                }
            }
        }
        Command::Summarize {
            index,
            report,
            focus,
            max_length,
            min_length,
            batch_size,
        } => match &cli.summary_endpoint {
            Some(endpoint) => {
                let model = HttpSummaryModel::new(SummaryEndpointConfig {
                    endpoint: endpoint.clone(),
                    api_key: cli.summary_api_key.clone(),
                })
                .context("invalid summary endpoint")?;
                let summarizer =
                    MedicalReportSummarizer::new(model)?.with_lengths(*max_length, *min_length);
                summarize(&cli, &summarizer, index.as_deref(), report.as_deref(), focus, *batch_size)
                    .await?;
            }
            None => {
                let summarizer = MedicalReportSummarizer::new(ExtractiveSummaryModel)?
                    .with_lengths(*max_length, *min_length);
                summarize(&cli, &summarizer, index.as_deref(), report.as_deref(), focus, *batch_size)
                    .await?;
            }
        },
    }

    Ok(())
}

async fn summarize<M: SummaryModel + Send + Sync>(
    cli: &Cli,
    summarizer: &MedicalReportSummarizer<M>,
    index: Option<&str>,
    report: Option<&Path>,
    focus: &[String],
    batch_size: usize,
) -> anyhow::Result<()> {
    if let Some(path) = report {
        let text = read_report(cli, path)?;
        let summary = summarizer
            .summarize(&text, Some(focus), true)
            .await
            .with_context(|| format!("failed to summarize {}", path.display()))?;
        print_report_summary(&summary);
        return Ok(());
    }

    let Some(index) = index else {
        anyhow::bail!("either --index or --report is required");
    };
    let chunks = load_text_store(&cli.vector_db_dir, index)
        .with_context(|| format!("failed to load text store for index '{index}'"))?;
    info!(index, chunk_count = chunks.len(), "summarizing stored chunks");

    let summary = summarizer.summarize_chunks(&chunks, batch_size).await?;
    println!("{summary}");
    Ok(())
}

fn read_report(cli: &Cli, path: &Path) -> anyhow::Result<String> {
    let is_pdf = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"));

    if !is_pdf {
        return std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()));
    }

    let parser = PdfParser::new(ParserOptions {
        ocr_engine: cli.ocr_engine(),
        detect_headings: true,
        output_dir: cli.output_dir.clone(),
    })?;
    Ok(parser.parse_pdf(path, &[])?.content)
}

fn print_report_summary(summary: &ReportSummary) {
    println!("Summary:\n{}\n", summary.main_summary);

    for (section, text) in &summary.sections {
        println!("[{section}] {text}");
    }

    for (category, values) in &summary.key_findings {
        if !values.is_empty() {
            println!("{category}: {}", values.join(", "));
        }
    }

    if let Some(focused) = &summary.focused_summary {
        println!("\nFocused summary:\n{focused}");
    }
}
