use crate::bm25::{word_tokenize, Bm25Index};
use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::{FusionWeights, SearchHit, SignalScores};
use crate::store::load_aligned;
use crate::tfidf::{TfidfConfig, TfidfIndex};
use crate::vector_index::FlatL2Index;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info};

const DISTANCE_EPSILON: f64 = 1e-10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    top_k: usize,
    weights: [u64; 3],
}

/// Fuses BM25, dense vector and TF-IDF relevance over one document's chunks.
pub struct HybridSearchEngine<E: Embedder> {
    index: FlatL2Index,
    documents: Vec<String>,
    embedder: E,
    bm25: Bm25Index,
    tfidf: TfidfIndex,
    cache: HashMap<CacheKey, Vec<SearchHit>>,
}

impl<E: Embedder> HybridSearchEngine<E> {
    /// Loads `<name>.index` and `<name>.json` from `dir` and builds the side indices.
    pub fn open(dir: &Path, name: &str, embedder: E) -> Result<Self, SearchError> {
        info!(dir = %dir.display(), name, "initializing hybrid search engine");
        let (index, documents) = load_aligned(dir, name)?;
        info!(documents = documents.len(), "loaded flat index and text store");
        Self::from_parts(index, documents, embedder)
    }

    pub fn from_parts(
        index: FlatL2Index,
        documents: Vec<String>,
        embedder: E,
    ) -> Result<Self, SearchError> {
        if index.len() != documents.len() {
            return Err(SearchError::Misaligned {
                vectors: index.len(),
                texts: documents.len(),
            });
        }
        if !index.is_empty() && index.dimension() != embedder.dimensions() {
            return Err(SearchError::DimensionMismatch {
                expected: index.dimension(),
                actual: embedder.dimensions(),
            });
        }

        let tokenized = documents
            .iter()
            .map(|document| word_tokenize(document))
            .collect::<Vec<_>>();
        let bm25 = Bm25Index::new(&tokenized);
        let tfidf = TfidfIndex::fit(&documents, TfidfConfig::default())?;

        Ok(Self {
            index,
            documents,
            embedder,
            bm25,
            tfidf,
            cache: HashMap::new(),
        })
    }

    pub fn documents(&self) -> &[String] {
        &self.documents
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    /// Returns the `top_k` best chunks by weighted lexical, dense and sparse
    /// relevance. Results are memoized per query, `top_k` and weights.
    ///
    /// The dense signal only covers the `top_k` nearest neighbours in the
    /// vector index; every other chunk scores 0 on it.
    pub fn hybrid_search(
        &mut self,
        query: &str,
        top_k: usize,
        weights: Option<FusionWeights>,
    ) -> Result<Vec<SearchHit>, SearchError> {
        let weights = weights.unwrap_or_default();
        let key = CacheKey {
            query: query.to_string(),
            top_k,
            weights: weights.cache_bits(),
        };

        if let Some(cached) = self.cache.get(&key) {
            debug!(query, top_k, "returning cached search results");
            return Ok(cached.clone());
        }

        debug!(query, top_k, "performing hybrid search");
        let hits = self.score(query, top_k, weights)?;
        self.cache.insert(key, hits.clone());
        Ok(hits)
    }

    fn score(
        &self,
        query: &str,
        top_k: usize,
        weights: FusionWeights,
    ) -> Result<Vec<SearchHit>, SearchError> {
        if top_k == 0 || self.documents.is_empty() {
            return Ok(Vec::new());
        }

        let lexical = lexical_signal(&self.bm25.get_scores(&word_tokenize(query)));
        debug!(preview = ?preview(&lexical), "bm25 scores (normalized)");

        let dense = self.dense_scores(query, top_k)?;
        debug!(preview = ?preview(&dense), "dense scores");

        let sparse = self.tfidf.cosine_scores(query);
        debug!(preview = ?preview(&sparse), "tf-idf scores");

        let mut hits = (0..self.documents.len())
            .map(|position| {
                let signals = SignalScores {
                    lexical: lexical[position],
                    dense: dense[position],
                    sparse: sparse[position],
                };
                SearchHit {
                    position,
                    text: self.documents[position].clone(),
                    score: weights.lexical * signals.lexical
                        + weights.dense * signals.dense
                        + weights.sparse * signals.sparse,
                    signals,
                }
            })
            .collect::<Vec<_>>();

        hits.sort_by(|left, right| {
            right
                .score
                .total_cmp(&left.score)
                .then(left.position.cmp(&right.position))
        });
        hits.truncate(top_k);
        debug!(returned = hits.len(), "hybrid search complete");
        Ok(hits)
    }

    fn dense_scores(&self, query: &str, top_k: usize) -> Result<Vec<f64>, SearchError> {
        let mut scores = vec![0.0; self.documents.len()];
        let query_vector = self.embedder.embed(query)?;
        let neighbours = self.index.search(&query_vector, top_k)?;
        debug!(?neighbours, "flat index neighbours");

        let Some(max_distance) = neighbours
            .iter()
            .map(|(_, distance)| *distance as f64)
            .max_by(f64::total_cmp)
        else {
            return Ok(scores);
        };
        let max_distance = max_distance + DISTANCE_EPSILON;

        for (position, distance) in neighbours {
            if let Some(slot) = scores.get_mut(position) {
                *slot = 1.0 - distance as f64 / max_distance;
            }
        }

        Ok(scores)
    }
}

/// Min-max normalizes into `[0, 1]`. Input where every score is equal
/// (including all zeros) is returned unchanged.
pub fn normalize_scores(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if scores.is_empty() || max - min == 0.0 {
        return scores.to_vec();
    }

    scores.iter().map(|score| (score - min) / (max - min)).collect()
}

/// BM25 scores mapped into `[0, 1]`. A flat score vector carries no ranking
/// information, and BM25 idf can be negative there (one-document corpus, or a
/// term in every document), so it contributes zeros.
fn lexical_signal(raw: &[f64]) -> Vec<f64> {
    let is_flat = raw.windows(2).all(|pair| pair[0] == pair[1]);
    if is_flat {
        return vec![0.0; raw.len()];
    }
    normalize_scores(raw)
}

fn preview(scores: &[f64]) -> &[f64] {
    &scores[..scores.len().min(5)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashedNgramEmbedder;
    use crate::store::{embed_all, store_in_index};
    use std::cell::Cell;
    use tempfile::tempdir;

    fn corpus() -> Vec<String> {
        vec![
            "Patient diagnosed with pneumonia, treated with antibiotics.".to_string(),
            "MRI scan shows no abnormalities in the brain.".to_string(),
            "Blood test indicates high cholesterol levels.".to_string(),
            "Patient admitted for severe chest pain.".to_string(),
            "Doctor prescribed painkillers for post-surgery recovery.".to_string(),
        ]
    }

    /// Counts embedding calls so tests can tell cache hits from recomputation.
    struct CountingEmbedder {
        inner: HashedNgramEmbedder,
        calls: Cell<usize>,
    }

    impl Embedder for CountingEmbedder {
        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
            self.calls.set(self.calls.get() + 1);
            self.inner.embed(text)
        }
    }

    fn engine() -> HybridSearchEngine<CountingEmbedder> {
        engine_over(corpus())
    }

    fn engine_over(documents: Vec<String>) -> HybridSearchEngine<CountingEmbedder> {
        let inner = HashedNgramEmbedder { dimensions: 64 };
        let mut index = FlatL2Index::new(64);
        index
            .add(&embed_all(&inner, &documents).expect("local embedding"))
            .expect("dimensions match");
        HybridSearchEngine::from_parts(
            index,
            documents,
            CountingEmbedder {
                inner,
                calls: Cell::new(0),
            },
        )
        .expect("aligned parts")
    }

    #[test]
    fn normalize_maps_extremes_to_unit_interval() {
        let normalized = normalize_scores(&[2.0, 4.0, 3.0]);
        assert_eq!(normalized, vec![0.0, 1.0, 0.5]);
    }

    #[test]
    fn normalize_leaves_equal_scores_untouched() {
        assert_eq!(normalize_scores(&[0.0, 0.0]), vec![0.0, 0.0]);
        assert_eq!(normalize_scores(&[1.5, 1.5, 1.5]), vec![1.5, 1.5, 1.5]);
        assert!(normalize_scores(&[]).is_empty());
    }

    fn assert_unit_interval(hits: &[SearchHit]) {
        for hit in hits {
            for value in [
                hit.score,
                hit.signals.lexical,
                hit.signals.dense,
                hit.signals.sparse,
            ] {
                assert!((0.0..=1.0 + 1e-9).contains(&value), "{hit:?}");
            }
        }
    }

    #[test]
    fn single_chunk_scores_stay_in_unit_interval() -> Result<(), SearchError> {
        let mut engine = engine_over(vec!["Patient admitted for severe chest pain.".to_string()]);
        let hits = engine.hybrid_search("chest pain", 5, None)?;

        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].signals.lexical, 0.0);
        assert_unit_interval(&hits);
        Ok(())
    }

    #[test]
    fn uniform_bm25_scores_contribute_nothing() -> Result<(), SearchError> {
        let mut engine = engine_over(vec![
            "Chest pain at rest.".to_string(),
            "Abdominal pain after meals.".to_string(),
            "Back pain when lifting.".to_string(),
        ]);
        let query = vec!["pain"; 40].join(" ");
        let hits = engine.hybrid_search(&query, 3, None)?;

        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|hit| hit.signals.lexical == 0.0));
        assert_unit_interval(&hits);
        Ok(())
    }

    #[test]
    fn results_are_truncated_to_top_k() -> Result<(), SearchError> {
        let mut engine = engine();
        assert_eq!(engine.hybrid_search("chest pain", 2, None)?.len(), 2);
        assert_eq!(engine.hybrid_search("chest pain", 50, None)?.len(), 5);
        assert!(engine.hybrid_search("chest pain", 0, None)?.is_empty());
        Ok(())
    }

    #[test]
    fn relevant_chunk_ranks_first() -> Result<(), SearchError> {
        let mut engine = engine();
        let hits = engine.hybrid_search("severe chest pain", 3, None)?;
        assert_eq!(hits[0].position, 3);
        assert!(hits[0].text.contains("chest pain"));
        assert!(hits.windows(2).all(|pair| pair[0].score >= pair[1].score));
        Ok(())
    }

    #[test]
    fn score_is_weighted_sum_of_signals() -> Result<(), SearchError> {
        let mut engine = engine();
        let weights = FusionWeights {
            lexical: 0.5,
            dense: 0.25,
            sparse: 0.25,
        };
        for hit in engine.hybrid_search("cholesterol blood test", 5, Some(weights))? {
            let expected = 0.5 * hit.signals.lexical
                + 0.25 * hit.signals.dense
                + 0.25 * hit.signals.sparse;
            assert!((hit.score - expected).abs() < 1e-12);
            assert!((0.0..=1.0).contains(&hit.signals.lexical));
        }
        Ok(())
    }

    #[test]
    fn dense_signal_only_covers_top_k_neighbours() -> Result<(), SearchError> {
        let engine = engine();
        let dense = engine.dense_scores("patient chest pain", 2)?;

        assert_eq!(dense.len(), 5);
        assert!(dense.iter().filter(|score| **score != 0.0).count() <= 2);
        assert!(dense.iter().all(|score| (0.0..=1.0).contains(score)));

        // A single neighbour sits at the maximum distance and scores ~0.
        let single = engine.dense_scores("patient chest pain", 1)?;
        assert!(single.iter().all(|score| score.abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn repeated_queries_are_deterministic_and_cached() -> Result<(), SearchError> {
        let mut engine = engine();
        let first = engine.hybrid_search("brain MRI", 3, None)?;
        let calls_after_first = engine.embedder.calls.get();
        let second = engine.hybrid_search("brain MRI", 3, None)?;

        assert_eq!(first, second);
        assert_eq!(engine.embedder.calls.get(), calls_after_first);
        assert_eq!(engine.cache_len(), 1);
        Ok(())
    }

    #[test]
    fn unseen_query_bypasses_cache() -> Result<(), SearchError> {
        let mut engine = engine();
        engine.hybrid_search("brain MRI", 3, None)?;
        let calls = engine.embedder.calls.get();

        engine.hybrid_search("antibiotics", 3, None)?;
        engine.hybrid_search("brain MRI", 4, None)?;
        assert_eq!(engine.embedder.calls.get(), calls + 2);
        assert_eq!(engine.cache_len(), 3);
        Ok(())
    }

    #[test]
    fn misaligned_parts_are_rejected() {
        let inner = HashedNgramEmbedder { dimensions: 8 };
        let result = HybridSearchEngine::from_parts(FlatL2Index::new(8), corpus(), inner);
        assert!(matches!(result, Err(SearchError::Misaligned { .. })));
    }

    #[test]
    fn engine_opens_stored_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let embedder = HashedNgramEmbedder::default();
        store_in_index(dir.path(), "records", &embedder, &corpus())?;

        let mut engine = HybridSearchEngine::open(dir.path(), "records", embedder)?;
        assert_eq!(engine.documents().len(), 5);
        let hits = engine.hybrid_search("antibiotics for pneumonia", 1, None)?;
        assert_eq!(hits[0].position, 0);
        Ok(())
    }

    #[test]
    fn empty_corpus_returns_no_hits() -> Result<(), SearchError> {
        let embedder = HashedNgramEmbedder { dimensions: 16 };
        let mut engine = HybridSearchEngine::from_parts(FlatL2Index::new(16), Vec::new(), embedder)?;
        assert!(engine.hybrid_search("anything", 5, None)?.is_empty());
        Ok(())
    }
}
