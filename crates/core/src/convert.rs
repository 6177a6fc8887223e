//! PDF conversion: page text is grouped into headings, list items and
//! paragraphs, then exported as JSON, plain text, markdown or doctags.

use crate::error::IngestError;
use crate::extractor::{extract_page_texts, OcrEngine, PageText};
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const ALL_EXPORT_FORMATS: [&str; 4] = ["json", "txt", "md", "doctags"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExportFormat {
    Json,
    Text,
    Markdown,
    DocTags,
}

impl ExportFormat {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "txt" => Some(Self::Text),
            "md" => Some(Self::Markdown),
            "doctags" => Some(Self::DocTags),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "txt",
            Self::Markdown => "md",
            Self::DocTags => "doctags",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ParserOptions {
    pub ocr_engine: OcrEngine,
    /// Detect section headings and list items line by line; off means every
    /// run of lines is a paragraph.
    pub detect_headings: bool,
    pub output_dir: PathBuf,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            ocr_engine: OcrEngine::None,
            detect_headings: true,
            output_dir: PathBuf::from("parsed_pdfs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum Block {
    Heading(String),
    ListItem(String),
    Paragraph(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PageBlocks {
    pub number: u32,
    pub blocks: Vec<Block>,
}

#[derive(Debug, Clone, Serialize)]
struct JsonExport<'a> {
    name: &'a str,
    source_path: String,
    pages: &'a [PageBlocks],
}

#[derive(Debug, Clone)]
pub struct ParseReport {
    pub processing_time: Duration,
    pub export_paths: BTreeMap<String, PathBuf>,
    pub document_name: String,
    pub ocr_enabled: bool,
    pub structure_enabled: bool,
    /// Markdown rendering of the document, regardless of the exported formats.
    pub content: String,
}

pub struct PdfParser {
    options: ParserOptions,
    heading: Regex,
    bullet: Regex,
}

impl PdfParser {
    pub fn new(options: ParserOptions) -> Result<Self, IngestError> {
        Ok(Self {
            options,
            heading: Regex::new(r"^\d+(?:\.\d+)*\.?\s+[A-Z].{0,80}$")?,
            bullet: Regex::new(r"^(?:[-*•▪◦]|\d+[.)])\s+(.+)$")?,
        })
    }

    pub fn options(&self) -> &ParserOptions {
        &self.options
    }

    /// Converts `input` and writes one file per requested format to the output
    /// directory, which is created on the first export. Unknown format names
    /// are skipped.
    pub fn parse_pdf(&self, input: &Path, formats: &[&str]) -> Result<ParseReport, IngestError> {
        if !input.exists() {
            return Err(IngestError::NotFound(input.display().to_string()));
        }

        let started = Instant::now();
        let pages = extract_page_texts(input, &self.options.ocr_engine)?;
        let structured = self.structure_pages(&pages);
        let processing_time = started.elapsed();
        info!(
            path = %input.display(),
            pages = structured.len(),
            seconds = processing_time.as_secs_f64(),
            "document converted"
        );

        let document_name = input
            .file_stem()
            .and_then(|stem| stem.to_str())
            .ok_or_else(|| IngestError::MissingFileName(input.display().to_string()))?
            .to_string();

        let mut export_paths = BTreeMap::new();
        for name in formats {
            let Some(format) = ExportFormat::parse(name) else {
                warn!(format = %name, "skipping unknown export format");
                continue;
            };

            let rendered = match format {
                ExportFormat::Json => serde_json::to_string_pretty(&JsonExport {
                    name: &document_name,
                    source_path: input.to_string_lossy().to_string(),
                    pages: &structured,
                })?,
                ExportFormat::Text => render_text(&structured),
                ExportFormat::Markdown => render_markdown(&structured),
                ExportFormat::DocTags => render_doctags(&structured),
            };

            let output_path = self
                .options
                .output_dir
                .join(format!("{document_name}.{}", format.extension()));
            fs::create_dir_all(&self.options.output_dir)?;
            fs::write(&output_path, rendered)?;
            export_paths.insert(format.extension().to_string(), output_path);
        }

        Ok(ParseReport {
            processing_time,
            export_paths,
            document_name,
            ocr_enabled: self.options.ocr_engine.is_enabled(),
            structure_enabled: self.options.detect_headings,
            content: render_markdown(&structured),
        })
    }

    pub fn structure_pages(&self, pages: &[PageText]) -> Vec<PageBlocks> {
        pages
            .iter()
            .map(|page| PageBlocks {
                number: page.number,
                blocks: self.structure_text(&page.text),
            })
            .collect()
    }

    fn structure_text(&self, text: &str) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut paragraph: Vec<&str> = Vec::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() {
                flush_paragraph(&mut paragraph, &mut blocks);
                continue;
            }

            if self.options.detect_headings {
                if self.is_heading(line) {
                    flush_paragraph(&mut paragraph, &mut blocks);
                    blocks.push(Block::Heading(line.trim_end_matches(':').to_string()));
                    continue;
                }
                if let Some(item) = self.bullet.captures(line).and_then(|caps| caps.get(1)) {
                    flush_paragraph(&mut paragraph, &mut blocks);
                    blocks.push(Block::ListItem(item.as_str().to_string()));
                    continue;
                }
            }

            paragraph.push(line);
        }

        flush_paragraph(&mut paragraph, &mut blocks);
        blocks
    }

    fn is_heading(&self, line: &str) -> bool {
        if self.heading.is_match(line) {
            return true;
        }

        let letters = line.chars().filter(|c| c.is_alphabetic()).count();
        line.chars().count() <= 60
            && letters >= 3
            && line.chars().filter(|c| c.is_alphabetic()).all(char::is_uppercase)
    }
}

fn flush_paragraph(paragraph: &mut Vec<&str>, blocks: &mut Vec<Block>) {
    if !paragraph.is_empty() {
        blocks.push(Block::Paragraph(paragraph.join(" ")));
        paragraph.clear();
    }
}

pub fn render_text(pages: &[PageBlocks]) -> String {
    pages
        .iter()
        .map(|page| {
            page.blocks
                .iter()
                .map(|block| match block {
                    Block::Heading(text) | Block::Paragraph(text) => text.clone(),
                    Block::ListItem(text) => format!("- {text}"),
                })
                .collect::<Vec<_>>()
                .join("\n\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn render_markdown(pages: &[PageBlocks]) -> String {
    let mut out = String::new();
    for page in pages {
        for block in &page.blocks {
            match block {
                Block::Heading(text) => out.push_str(&format!("\n## {text}\n\n")),
                Block::ListItem(text) => out.push_str(&format!("\n- {text}")),
                Block::Paragraph(text) => out.push_str(&format!("\n\n{text}\n\n")),
            }
        }
    }
    collapse_blank_runs(out.trim())
}

pub fn render_doctags(pages: &[PageBlocks]) -> String {
    let mut out = String::from("<doctag>");
    for (position, page) in pages.iter().enumerate() {
        if position > 0 {
            out.push_str("<page_break>");
        }
        for block in &page.blocks {
            let (tag, text) = match block {
                Block::Heading(text) => ("section_header_level_1", text),
                Block::ListItem(text) => ("list_item", text),
                Block::Paragraph(text) => ("text", text),
            };
            out.push_str(&format!("<{tag}>{}</{tag}>", escape_markup(text)));
        }
    }
    out.push_str("</doctag>");
    out
}

fn escape_markup(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn collapse_blank_runs(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut newlines = 0;
    for ch in text.chars() {
        if ch == '\n' {
            newlines += 1;
            if newlines > 2 {
                continue;
            }
        } else {
            newlines = 0;
        }
        out.push(ch);
    }
    out
}
