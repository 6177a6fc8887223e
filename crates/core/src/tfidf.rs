use crate::error::SearchError;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};

pub const DEFAULT_MAX_FEATURES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct TfidfConfig {
    pub min_ngram: usize,
    pub max_ngram: usize,
    pub max_features: usize,
}

impl Default for TfidfConfig {
    fn default() -> Self {
        Self {
            min_ngram: 1,
            max_ngram: 3,
            max_features: DEFAULT_MAX_FEATURES,
        }
    }
}

/// Sparse row: `(feature id, weight)` pairs sorted by feature id.
pub type SparseVector = Vec<(usize, f64)>;

/// TF-IDF vectorizer fitted on a fixed corpus with smooth idf and L2-normalized rows.
#[derive(Debug, Clone)]
pub struct TfidfIndex {
    config: TfidfConfig,
    token_pattern: Regex,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    rows: Vec<SparseVector>,
}

impl TfidfIndex {
    pub fn fit(documents: &[String], config: TfidfConfig) -> Result<Self, SearchError> {
        if config.min_ngram == 0 || config.min_ngram > config.max_ngram {
            return Err(SearchError::InvalidConfig(format!(
                "invalid n-gram range {}..={}",
                config.min_ngram, config.max_ngram
            )));
        }

        let token_pattern = Regex::new(r"\b\w\w+\b")?;

        let counted = documents
            .iter()
            .map(|document| count_terms(&token_pattern, document, &config))
            .collect::<Vec<_>>();

        let mut corpus_frequency = HashMap::<&str, usize>::new();
        let mut document_frequency = HashMap::<&str, usize>::new();
        for counts in &counted {
            for (term, count) in counts {
                *corpus_frequency.entry(term.as_str()).or_insert(0) += count;
                *document_frequency.entry(term.as_str()).or_insert(0) += 1;
            }
        }

        let mut ranked = corpus_frequency.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|left, right| right.1.cmp(&left.1).then(left.0.cmp(right.0)));
        ranked.truncate(config.max_features);

        let mut kept = ranked.into_iter().map(|(term, _)| term).collect::<Vec<_>>();
        kept.sort_unstable();

        let document_count = documents.len() as f64;
        let idf = kept
            .iter()
            .map(|term| {
                let df = document_frequency.get(term).copied().unwrap_or(0) as f64;
                ((1.0 + document_count) / (1.0 + df)).ln() + 1.0
            })
            .collect::<Vec<_>>();

        let vocabulary = kept
            .into_iter()
            .enumerate()
            .map(|(id, term)| (term.to_string(), id))
            .collect::<HashMap<_, _>>();

        let mut index = Self {
            config,
            token_pattern,
            vocabulary,
            idf,
            rows: Vec::new(),
        };
        let rows = counted.iter().map(|counts| index.weigh(counts)).collect();
        index.rows = rows;
        Ok(index)
    }

    pub fn vocabulary_len(&self) -> usize {
        self.vocabulary.len()
    }

    pub fn transform(&self, text: &str) -> SparseVector {
        let counts = count_terms(&self.token_pattern, text, &self.config);
        self.weigh(&counts)
    }

    /// Cosine similarity of `text` against every fitted document.
    pub fn cosine_scores(&self, text: &str) -> Vec<f64> {
        let query = self.transform(text);
        self.rows.iter().map(|row| sparse_dot(&query, row)).collect()
    }

    fn weigh(&self, counts: &BTreeMap<String, usize>) -> SparseVector {
        let mut row = counts
            .iter()
            .filter_map(|(term, count)| {
                self.vocabulary
                    .get(term)
                    .map(|&id| (id, *count as f64 * self.idf[id]))
            })
            .collect::<Vec<_>>();
        row.sort_by_key(|(id, _)| *id);

        let norm = row.iter().map(|(_, weight)| weight * weight).sum::<f64>().sqrt();
        if norm > 0.0 {
            for (_, weight) in &mut row {
                *weight /= norm;
            }
        }
        row
    }
}

fn count_terms(pattern: &Regex, text: &str, config: &TfidfConfig) -> BTreeMap<String, usize> {
    let lowered = text.to_lowercase();
    let tokens = pattern
        .find_iter(&lowered)
        .map(|found| found.as_str())
        .collect::<Vec<_>>();

    let mut counts = BTreeMap::new();
    for n in config.min_ngram..=config.max_ngram {
        if n > tokens.len() {
            break;
        }
        for window in tokens.windows(n) {
            *counts.entry(window.join(" ")).or_insert(0) += 1;
        }
    }
    counts
}

fn sparse_dot(left: &[(usize, f64)], right: &[(usize, f64)]) -> f64 {
    let (mut i, mut j) = (0, 0);
    let mut total = 0.0;
    while i < left.len() && j < right.len() {
        match left[i].0.cmp(&right[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                total += left[i].1 * right[j].1;
                i += 1;
                j += 1;
            }
        }
    }
    total
}
