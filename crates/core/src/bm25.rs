use std::collections::HashMap;

const K1: f64 = 1.5;
const B: f64 = 0.75;
const EPSILON: f64 = 0.25;

/// Splits text into runs of word characters and runs of punctuation, keeping
/// case. `"BP: 120/80"` becomes `["BP", ":", "120", "/", "80"]`.
pub fn word_tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut current_is_word = false;

    for ch in text.chars() {
        if ch.is_whitespace() {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            continue;
        }

        let is_word = ch.is_alphanumeric() || ch == '_';
        if !current.is_empty() && is_word != current_is_word {
            tokens.push(std::mem::take(&mut current));
        }
        current_is_word = is_word;
        current.push(ch);
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Okapi BM25 over a fixed, pre-tokenized corpus.
///
/// Terms present in more than half of the documents would get a negative idf;
/// those are floored at `EPSILON * mean idf` instead.
#[derive(Debug, Clone)]
pub struct Bm25Index {
    doc_freqs: Vec<HashMap<String, usize>>,
    doc_lengths: Vec<usize>,
    average_length: f64,
    idf: HashMap<String, f64>,
}

impl Bm25Index {
    pub fn new(corpus: &[Vec<String>]) -> Self {
        let mut doc_freqs = Vec::with_capacity(corpus.len());
        let mut doc_lengths = Vec::with_capacity(corpus.len());
        let mut containing = HashMap::<String, usize>::new();

        for document in corpus {
            let mut frequencies = HashMap::<String, usize>::new();
            for token in document {
                *frequencies.entry(token.clone()).or_insert(0) += 1;
            }
            for term in frequencies.keys() {
                *containing.entry(term.clone()).or_insert(0) += 1;
            }
            doc_lengths.push(document.len());
            doc_freqs.push(frequencies);
        }

        let total_length: usize = doc_lengths.iter().sum();
        let average_length = if corpus.is_empty() {
            0.0
        } else {
            total_length as f64 / corpus.len() as f64
        };

        let document_count = corpus.len() as f64;
        let mut idf = HashMap::with_capacity(containing.len());
        let mut idf_sum = 0.0;
        let mut negative = Vec::new();

        for (term, count) in containing {
            let count = count as f64;
            let value = (document_count - count + 0.5).ln() - (count + 0.5).ln();
            idf_sum += value;
            if value < 0.0 {
                negative.push(term.clone());
            }
            idf.insert(term, value);
        }

        if !idf.is_empty() {
            let floor = EPSILON * (idf_sum / idf.len() as f64);
            for term in negative {
                idf.insert(term, floor);
            }
        }

        Self {
            doc_freqs,
            doc_lengths,
            average_length,
            idf,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// Scores every document against the query tokens. Repeated query tokens
    /// count once per occurrence.
    pub fn get_scores(&self, query: &[String]) -> Vec<f64> {
        let mut scores = vec![0.0; self.len()];
        if self.average_length == 0.0 {
            return scores;
        }

        for term in query {
            let Some(idf) = self.idf.get(term) else {
                continue;
            };

            for (position, frequencies) in self.doc_freqs.iter().enumerate() {
                let frequency = frequencies.get(term).copied().unwrap_or(0) as f64;
                let length_ratio = self.doc_lengths[position] as f64 / self.average_length;
                let denominator = frequency + K1 * (1.0 - B + B * length_ratio);
                scores[position] += idf * (frequency * (K1 + 1.0) / denominator);
            }
        }

        scores
    }
}
