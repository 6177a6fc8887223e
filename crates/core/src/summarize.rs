use crate::error::SummarizeError;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};
use url::Url;

pub const NO_FOCUS_MATCH: &str = "No specific information found for the requested focus areas.";

const SECTION_HEADERS: [(&str, &[&str]); 4] = [
    (
        "history",
        &[
            "past medical history",
            "history of present illness",
            "social history",
        ],
    ),
    (
        "examination",
        &["physical examination", "clinical examination", "findings"],
    ),
    ("assessment", &["assessment", "impression", "diagnosis"]),
    ("plan", &["treatment plan", "recommendations", "plan"]),
];

const FINDING_PATTERNS: [(&str, &str); 4] = [
    ("measurements", r"\d+\.?\d*\s*(?:mg|ml|g|kg|mm|cm|mcg)\b"),
    ("lab_values", r"\d+\.?\d*\s*(?:WBC|RBC|HGB|HCT|MCV|PLT)\b"),
    ("vital_signs", r"\b(?:BP|HR|RR|SpO2|Temp):?\s*\d+\.?\d*"),
    ("dates", r"\b\d{1,2}[-/]\d{1,2}[-/]\d{2,4}\b"),
];

/// Seq2seq summarization backend.
#[async_trait]
pub trait SummaryModel {
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        min_length: usize,
    ) -> Result<String, SummarizeError>;
}

/// Offline stand-in for an abstractive model: keeps leading sentences until
/// the word budget runs out. Always keeps at least one sentence.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummaryModel;

#[async_trait]
impl SummaryModel for ExtractiveSummaryModel {
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        _min_length: usize,
    ) -> Result<String, SummarizeError> {
        let sentences = split_sentences(text);
        if sentences.is_empty() {
            return Err(SummarizeError::EmptyInput);
        }

        let mut picked = Vec::new();
        let mut words = 0usize;
        for sentence in sentences {
            let sentence_words = sentence.split_whitespace().count();
            if !picked.is_empty() && words + sentence_words > max_length {
                break;
            }
            words += sentence_words;
            picked.push(sentence);
        }

        Ok(picked.join(" "))
    }
}

#[derive(Debug, Clone)]
pub struct SummaryEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryText {
    summary_text: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SummaryResponse {
    Batch(Vec<SummaryText>),
    Single(SummaryText),
}

/// Calls a summarization inference endpoint with greedy decoding.
pub struct HttpSummaryModel {
    config: SummaryEndpointConfig,
    client: Client,
}

impl HttpSummaryModel {
    pub fn new(config: SummaryEndpointConfig) -> Result<Self, SummarizeError> {
        Url::parse(&config.endpoint)?;
        Ok(Self {
            config,
            client: Client::new(),
        })
    }
}

#[async_trait]
impl SummaryModel for HttpSummaryModel {
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        min_length: usize,
    ) -> Result<String, SummarizeError> {
        if text.trim().is_empty() {
            return Err(SummarizeError::EmptyInput);
        }

        let mut request = self.client.post(&self.config.endpoint).json(&json!({
            "inputs": text,
            "parameters": {
                "max_length": max_length,
                "min_length": min_length,
                "do_sample": false,
            }
        }));

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(SummarizeError::BackendResponse {
                backend: "summarizer".to_string(),
                details: response.status().to_string(),
            });
        }

        match response.json::<SummaryResponse>().await? {
            SummaryResponse::Single(single) => Ok(single.summary_text),
            SummaryResponse::Batch(batch) => batch
                .into_iter()
                .next()
                .map(|first| first.summary_text)
                .ok_or_else(|| SummarizeError::BackendResponse {
                    backend: "summarizer".to_string(),
                    details: "empty summary batch".to_string(),
                }),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportSummary {
    pub main_summary: String,
    pub sections: BTreeMap<String, String>,
    pub key_findings: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub focused_summary: Option<String>,
}

struct SectionHeader {
    section: &'static str,
    pattern: Regex,
}

/// Summarizes medical reports: the text is normalized around section headers
/// and clinical values, summarized as a whole and per section, and clinical
/// values are pulled out verbatim.
pub struct MedicalReportSummarizer<M: SummaryModel> {
    model: M,
    pub max_length: usize,
    pub min_length: usize,
    pub use_medical_preprocessing: bool,
    headers: Vec<SectionHeader>,
    findings: Vec<(&'static str, Regex)>,
    horizontal_space: Regex,
}

impl<M: SummaryModel + Send + Sync> MedicalReportSummarizer<M> {
    pub fn new(model: M) -> Result<Self, SummarizeError> {
        let headers = SECTION_HEADERS
            .iter()
            .flat_map(|(section, names)| {
                names.iter().map(move |name| {
                    Regex::new(&format!(r"(?i)\b{}\s*:", regex::escape(name)))
                        .map(|pattern| SectionHeader {
                            section: *section,
                            pattern,
                        })
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let findings = FINDING_PATTERNS
            .iter()
            .map(|(category, pattern)| {
                Regex::new(&format!("(?i){pattern}")).map(|compiled| (*category, compiled))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            model,
            max_length: 150,
            min_length: 50,
            use_medical_preprocessing: true,
            headers,
            findings,
            horizontal_space: Regex::new(r"[^\S\n]+")?,
        })
    }

    pub fn with_lengths(mut self, max_length: usize, min_length: usize) -> Self {
        self.max_length = max_length;
        self.min_length = min_length;
        self
    }

    /// Puts each recognized section header on its own `SECTION:` line and
    /// pads clinical values with spaces so they survive tokenization.
    pub fn preprocess_medical_text(&self, text: &str) -> String {
        let mut processed = self.horizontal_space.replace_all(text, " ").into_owned();

        for header in &self.headers {
            let replacement = format!("\n{}:", header.section.to_uppercase());
            processed = header
                .pattern
                .replace_all(&processed, replacement.as_str())
                .into_owned();
        }

        for (_, pattern) in &self.findings {
            processed = pattern
                .replace_all(&processed, |caps: &regex::Captures| format!(" {} ", &caps[0]))
                .into_owned();
        }

        processed
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Groups lines under the most recent `SECTION:` header; text before any
    /// header lands in `other`.
    pub fn extract_key_sections(&self, text: &str) -> BTreeMap<String, String> {
        let mut sections = BTreeMap::<String, String>::new();
        let mut current = "other".to_string();

        for line in text.lines() {
            let (body, header) = match line.split_once(':') {
                Some((label, rest)) => match section_for_label(label) {
                    Some(section) => (rest, Some(section)),
                    None => (line, None),
                },
                None => (line, None),
            };

            if let Some(section) = header {
                current = section.to_string();
            }

            let body = body.trim();
            if !body.is_empty() {
                let entry = sections.entry(current.clone()).or_default();
                if !entry.is_empty() {
                    entry.push(' ');
                }
                entry.push_str(body);
            }
        }

        sections
    }

    pub fn extract_key_findings(&self, text: &str) -> BTreeMap<String, Vec<String>> {
        self.findings
            .iter()
            .map(|(category, pattern)| {
                let matches = pattern
                    .find_iter(text)
                    .map(|found| found.as_str().trim().to_string())
                    .collect();
                (category.to_string(), matches)
            })
            .collect()
    }

    pub async fn generate_focused_summary(
        &self,
        text: &str,
        focus_areas: &[String],
    ) -> Result<String, SummarizeError> {
        let lowered_areas = focus_areas
            .iter()
            .map(|area| area.to_lowercase())
            .collect::<Vec<_>>();

        let relevant = split_sentences(text)
            .into_iter()
            .filter(|sentence| {
                let lowered = sentence.to_lowercase();
                lowered_areas.iter().any(|area| lowered.contains(area.as_str()))
            })
            .collect::<Vec<_>>();

        if relevant.is_empty() {
            return Ok(NO_FOCUS_MATCH.to_string());
        }

        self.model
            .summarize(&relevant.join(" "), self.max_length / 2, self.min_length / 2)
            .await
    }

    pub async fn summarize(
        &self,
        text: &str,
        focus_areas: Option<&[String]>,
        include_sections: bool,
    ) -> Result<ReportSummary, SummarizeError> {
        let processed = if self.use_medical_preprocessing {
            self.preprocess_medical_text(text)
        } else {
            text.to_string()
        };

        let main_summary = self
            .model
            .summarize(&processed, self.max_length, self.min_length)
            .await?;

        let mut summary = ReportSummary {
            main_summary,
            key_findings: self.extract_key_findings(&processed),
            ..ReportSummary::default()
        };

        if include_sections {
            for (section, content) in self.extract_key_sections(&processed) {
                if content.trim().is_empty() {
                    continue;
                }
                let section_summary = self
                    .model
                    .summarize(&content, self.max_length / 2, self.min_length / 2)
                    .await?;
                summary.sections.insert(section, section_summary);
            }
        }

        if let Some(areas) = focus_areas.filter(|areas| !areas.is_empty()) {
            summary.focused_summary = Some(self.generate_focused_summary(&processed, areas).await?);
        }

        Ok(summary)
    }

    pub async fn batch_summarize(
        &self,
        texts: &[String],
        batch_size: usize,
    ) -> Result<Vec<ReportSummary>, SummarizeError> {
        let mut summaries = Vec::with_capacity(texts.len());
        for (batch_no, batch) in texts.chunks(batch_size.max(1)).enumerate() {
            debug!(batch_no, size = batch.len(), "summarizing report batch");
            for text in batch {
                summaries.push(self.summarize(text, None, true).await?);
            }
        }
        Ok(summaries)
    }

    /// Long-document summary: each batch of chunks is summarized, then the
    /// partial summaries are summarized together.
    pub async fn summarize_chunks(
        &self,
        chunks: &[String],
        batch_size: usize,
    ) -> Result<String, SummarizeError> {
        let non_empty = chunks
            .iter()
            .filter(|chunk| !chunk.trim().is_empty())
            .cloned()
            .collect::<Vec<_>>();
        if non_empty.is_empty() {
            return Err(SummarizeError::EmptyInput);
        }

        let mut partials = Vec::new();
        for batch in non_empty.chunks(batch_size.max(1)) {
            let partial = self
                .model
                .summarize(&batch.join("\n\n"), self.max_length, self.min_length)
                .await?;
            partials.push(partial);
        }
        info!(chunks = non_empty.len(), partials = partials.len(), "reducing partial summaries");

        self.model
            .summarize(&partials.join(" "), self.max_length, self.min_length)
            .await
    }
}

fn section_for_label(label: &str) -> Option<&'static str> {
    let label = label.trim().to_lowercase();
    SECTION_HEADERS
        .iter()
        .map(|(section, _)| *section)
        .find(|section| *section == label)
}

/// Splits on `.`, `!` or `?` followed by whitespace or end of text.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let at_boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().map_or(true, |next| next.is_whitespace());
        if at_boundary {
            let sentence = current.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
            current.clear();
        }
    }

    let rest = current.trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const REPORT: &str = "Patient is a 54 year old male.\n\
        Past Medical History: hypertension, diabetes.\n\
        Physical Examination: BP: 140/90, HR 88, weight 82kg.\n\
        Assessment: uncontrolled hypertension.\n\
        Treatment Plan: start lisinopril 10mg on 03/14/2024.";

    fn summarizer() -> MedicalReportSummarizer<ExtractiveSummaryModel> {
        MedicalReportSummarizer::new(ExtractiveSummaryModel).expect("patterns compile")
    }

    /// Records how many model calls were made and echoes a fixed summary.
    #[derive(Default)]
    struct CountingModel {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SummaryModel for CountingModel {
        async fn summarize(
            &self,
            text: &str,
            _max_length: usize,
            _min_length: usize,
        ) -> Result<String, SummarizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("summary of {} words", text.split_whitespace().count()))
        }
    }

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Dose 2.5 mg daily. Stable! Follow up?"),
            vec!["Dose 2.5 mg daily.", "Stable!", "Follow up?"]
        );
    }

    #[test]
    fn headers_are_standardized_onto_their_own_lines() {
        let processed = summarizer().preprocess_medical_text(REPORT);
        assert!(processed.contains("\nHISTORY: hypertension, diabetes."));
        assert!(processed.contains("\nEXAMINATION: BP: 140"));
        assert!(processed.contains("\nASSESSMENT: uncontrolled hypertension."));
        assert!(processed.contains("\nPLAN: start lisinopril 10mg"));
    }

    #[test]
    fn sections_group_following_text() {
        let summarizer = summarizer();
        let sections = summarizer.extract_key_sections(&summarizer.preprocess_medical_text(REPORT));

        assert_eq!(
            sections.get("other").map(String::as_str),
            Some("Patient is a 54 year old male.")
        );
        assert_eq!(
            sections.get("assessment").map(String::as_str),
            Some("uncontrolled hypertension.")
        );
        assert!(sections["examination"].contains("HR 88"));
        assert!(sections["plan"].contains("lisinopril"));
    }

    #[test]
    fn key_findings_capture_clinical_values() {
        let findings = summarizer().extract_key_findings(REPORT);
        assert_eq!(findings["measurements"], vec!["82kg", "10mg"]);
        assert_eq!(findings["vital_signs"], vec!["BP: 140", "HR 88"]);
        assert_eq!(findings["dates"], vec!["03/14/2024"]);
        assert!(findings["lab_values"].is_empty());
    }

    #[tokio::test]
    async fn extractive_model_respects_word_budget() -> Result<(), SummarizeError> {
        let summary = ExtractiveSummaryModel
            .summarize("One two three. Four five six. Seven eight.", 6, 1)
            .await?;
        assert_eq!(summary, "One two three. Four five six.");
        Ok(())
    }

    #[tokio::test]
    async fn focused_summary_without_matches_returns_notice() -> Result<(), SummarizeError> {
        let focus = vec!["oncology".to_string()];
        let summary = summarizer().generate_focused_summary(REPORT, &focus).await?;
        assert_eq!(summary, NO_FOCUS_MATCH);
        Ok(())
    }

    #[tokio::test]
    async fn summarize_includes_sections_and_focus() -> Result<(), SummarizeError> {
        let focus = vec!["Hypertension".to_string()];
        let summary = summarizer().summarize(REPORT, Some(&focus), true).await?;

        assert!(!summary.main_summary.is_empty());
        assert!(summary.sections.contains_key("assessment"));
        assert!(summary
            .focused_summary
            .as_deref()
            .is_some_and(|focused| focused.to_lowercase().contains("hypertension")));
        Ok(())
    }

    #[tokio::test]
    async fn chunk_summaries_are_reduced_once() -> Result<(), SummarizeError> {
        let summarizer = MedicalReportSummarizer::new(CountingModel::default())?;
        let chunks = (0..5).map(|index| format!("chunk {index}")).collect::<Vec<_>>();

        let summary = summarizer.summarize_chunks(&chunks, 2).await?;

        assert_eq!(summary, "summary of 12 words");
        assert_eq!(summarizer.model.calls.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[tokio::test]
    async fn batch_summarize_keeps_input_order() -> Result<(), SummarizeError> {
        let texts = vec![
            "Assessment: stable angina.".to_string(),
            "Plan: discharge home.".to_string(),
            "Findings: clear lungs.".to_string(),
        ];
        let summaries = summarizer().batch_summarize(&texts, 2).await?;

        assert_eq!(summaries.len(), 3);
        assert!(summaries[1].main_summary.contains("discharge"));
        Ok(())
    }

    #[tokio::test]
    async fn empty_chunks_cannot_be_summarized() {
        let result = summarizer().summarize_chunks(&[" ".to_string()], 4).await;
        assert!(matches!(result, Err(SummarizeError::EmptyInput)));
    }
}
