use crate::error::IngestError;
use base64::{engine::general_purpose::STANDARD, Engine};
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::runtime::RuntimeFlavor;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct OcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrResponse {
    pages: Option<Vec<OcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OcrEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

impl OcrEndpointConfig {
    /// Reads `MEDRAG_OCR_ENDPOINT` and `MEDRAG_OCR_API_KEY`; blank values count as unset.
    pub fn from_env() -> Option<Self> {
        let endpoint = non_blank(std::env::var("MEDRAG_OCR_ENDPOINT").ok())?;
        let api_key = non_blank(std::env::var("MEDRAG_OCR_API_KEY").ok());
        Some(Self { endpoint, api_key })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|trimmed| !trimmed.is_empty())
}

/// Which OCR path backs up local text extraction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OcrEngine {
    #[default]
    None,
    Remote(OcrEndpointConfig),
}

impl OcrEngine {
    pub fn is_enabled(&self) -> bool {
        matches!(self, OcrEngine::Remote(_))
    }
}

pub trait PdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError>;
}

#[derive(Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, path: &Path) -> Result<Vec<PageText>, IngestError> {
        let document =
            Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, page_id) in document.get_pages() {
            let text = page_text(&document, page_id)
                .map_err(|error| IngestError::PdfParse(error.to_string()))?;

            if !text.trim().is_empty() {
                pages.push(PageText {
                    number: page_no,
                    text,
                });
            }
        }

        if pages.is_empty() {
            return Err(IngestError::PdfParse(format!(
                "pdf had no readable page text: {}",
                path.display()
            )));
        }

        Ok(pages)
    }
}

/// Decodes the shown text of one page, starting a new line wherever the
/// content stream moves to another text line: `Td`/`TD` with a vertical
/// offset, `T*`, `'`, `"`, a `Tm` on a different row, or the end of a text
/// object.
fn page_text(document: &Document, page_id: ObjectId) -> Result<String, lopdf::Error> {
    let encodings = document
        .get_page_fonts(page_id)
        .into_iter()
        .map(|(name, font)| (name, font.get_font_encoding()))
        .collect::<BTreeMap<Vec<u8>, &str>>();
    let content = Content::decode(&document.get_page_content(page_id)?)?;

    let mut text = String::new();
    let mut encoding = None;
    let mut row = None::<f32>;

    for operation in &content.operations {
        let operands = operation.operands.as_slice();
        match operation.operator.as_str() {
            "Tf" => {
                encoding = operands
                    .first()
                    .and_then(|font| font.as_name().ok())
                    .and_then(|name| encodings.get(name).copied());
            }
            "Td" | "TD" => {
                let moves_down = operands
                    .get(1)
                    .and_then(|offset| offset.as_float().ok())
                    .is_some_and(|offset| offset != 0.0);
                if moves_down {
                    break_line(&mut text);
                }
            }
            "Tm" => {
                let y = operands.get(5).and_then(|value| value.as_float().ok());
                if row.is_some() && y != row {
                    break_line(&mut text);
                }
                row = y;
            }
            "T*" | "ET" => break_line(&mut text),
            "'" => {
                break_line(&mut text);
                push_shown_text(&mut text, encoding, operands);
            }
            "\"" => {
                break_line(&mut text);
                push_shown_text(&mut text, encoding, operands.get(2..).unwrap_or(&[]));
            }
            "Tj" | "TJ" => push_shown_text(&mut text, encoding, operands),
            _ => {}
        }
    }

    Ok(text)
}

fn push_shown_text(text: &mut String, encoding: Option<&str>, operands: &[Object]) {
    for operand in operands {
        match operand {
            Object::String(bytes, _) => text.push_str(&Document::decode_text(encoding, bytes)),
            Object::Array(items) => push_shown_text(text, encoding, items),
            Object::Integer(kerning) if *kerning < -100 => text.push(' '),
            Object::Real(kerning) if *kerning < -100.0 => text.push(' '),
            _ => {}
        }
    }
}

fn break_line(text: &mut String) {
    if !text.is_empty() && !text.ends_with('\n') {
        text.push('\n');
    }
}

/// Extracts page text locally, falling back to the OCR endpoint when the
/// engine allows it and the PDF yields no parseable text.
pub fn extract_page_texts(path: &Path, ocr: &OcrEngine) -> Result<Vec<PageText>, IngestError> {
    if !path.exists() {
        return Err(IngestError::NotFound(path.display().to_string()));
    }

    match LopdfExtractor.extract_pages(path) {
        Ok(pages) => Ok(pages),
        Err(IngestError::PdfParse(parse_error)) => match ocr {
            OcrEngine::None => Err(IngestError::PdfParse(parse_error)),
            OcrEngine::Remote(config) => {
                warn!(path = %path.display(), error = %parse_error, "falling back to OCR endpoint");
                extract_with_ocr(path, config).map_err(|ocr_error| {
                    IngestError::PdfParse(format!(
                        "{parse_error}; OCR fallback failed: {ocr_error}"
                    ))
                })
            }
        },
        Err(error) => Err(error),
    }
}

fn extract_with_ocr(path: &Path, config: &OcrEndpointConfig) -> Result<Vec<PageText>, IngestError> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| extract_with_ocr_blocking(path, config))
        }
        _ => extract_with_ocr_blocking(path, config),
    }
}

fn extract_with_ocr_blocking(
    path: &Path,
    config: &OcrEndpointConfig,
) -> Result<Vec<PageText>, IngestError> {
    let pdf = std::fs::read(path)?;
    let payload = OcrRequest {
        pdf_base64: STANDARD.encode(pdf),
        source_path: path.to_string_lossy().to_string(),
    };

    let mut request = Client::new()
        .post(&config.endpoint)
        .header("content-type", "application/json")
        .json(&payload);

    if let Some(api_key) = &config.api_key {
        request = request.bearer_auth(api_key);
    }

    let response = request.send()?;

    if !response.status().is_success() {
        return Err(IngestError::OcrFailed(format!(
            "OCR request to {} returned {}",
            config.endpoint,
            response.status()
        )));
    }

    let payload: OcrResponse = response.json()?;
    let pages = payload_to_pages(&payload, path)?;
    info!(path = %path.display(), pages = pages.len(), "OCR extracted pages");
    Ok(pages)
}

fn payload_to_pages(payload: &OcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: page.page.unwrap_or(1),
                        text: text.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "OCR response was empty for {}",
        path.display()
    )))
}
