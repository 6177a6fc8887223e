use crate::error::SearchError;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::runtime::RuntimeFlavor;
use tracing::debug;
use url::Url;

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

pub trait Embedder {
    fn dimensions(&self) -> usize;
    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError>;
}

impl<E: Embedder + ?Sized> Embedder for Box<E> {
    fn dimensions(&self) -> usize {
        (**self).dimensions()
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        (**self).embed(text)
    }
}

/// Deterministic local encoder: every word contributes a hashed unigram
/// feature plus its character trigrams, features are mean pooled over the
/// words and the result is L2 normalized.
#[derive(Debug, Clone, Copy)]
pub struct HashedNgramEmbedder {
    pub dimensions: usize,
}

impl Default for HashedNgramEmbedder {
    fn default() -> Self {
        Self {
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
        }
    }
}

impl HashedNgramEmbedder {
    fn bucket(&self, feature: &str) -> usize {
        let mut hash = 1469598103934665603u64;
        for byte in feature.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(1099511628211);
        }
        (hash % self.dimensions.max(1) as u64) as usize
    }
}

impl Embedder for HashedNgramEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions.max(1)
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let mut pooled = vec![0f32; self.dimensions()];
        let lowered = text.to_lowercase();
        let words = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|word| !word.is_empty())
            .collect::<Vec<_>>();

        if words.is_empty() {
            return Ok(pooled);
        }

        for word in &words {
            pooled[self.bucket(word)] += 1.0;

            let padded = format!("#{word}#").chars().collect::<Vec<_>>();
            for window in padded.windows(3) {
                let trigram = window.iter().collect::<String>();
                pooled[self.bucket(&trigram)] += 0.5;
            }
        }

        let count = words.len() as f32;
        for value in &mut pooled {
            *value /= count;
        }

        Ok(l2_normalize(pooled))
    }
}

pub(crate) fn l2_normalize(mut vector: Vec<f32>) -> Vec<f32> {
    let magnitude = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for value in &mut vector {
            *value /= magnitude;
        }
    }
    vector
}

#[derive(Debug, Clone)]
pub struct EmbeddingEndpointConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub dimensions: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EmbeddingResponse {
    Object { embedding: Vec<f32> },
    Tokens(Vec<Vec<f32>>),
    Pooled(Vec<f32>),
}

/// Calls a feature-extraction inference endpoint for each text.
///
/// Token-level responses are mean pooled, which mirrors pooling the encoder's
/// last hidden state.
pub struct HttpEmbedder {
    config: EmbeddingEndpointConfig,
    client: Client,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingEndpointConfig) -> Result<Self, SearchError> {
        Url::parse(&config.endpoint)?;
        Ok(Self {
            config,
            client: Client::new(),
        })
    }

    fn embed_blocking(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .header("content-type", "application/json")
            .json(&json!({ "inputs": text }));

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        if !response.status().is_success() {
            return Err(SearchError::BackendResponse {
                backend: "embedding".to_string(),
                details: response.status().to_string(),
            });
        }

        let payload: EmbeddingResponse = response.json()?;
        let vector = pool_response(payload)?;
        debug!(dimensions = vector.len(), "received embedding");

        if vector.len() != self.config.dimensions {
            return Err(SearchError::DimensionMismatch {
                expected: self.config.dimensions,
                actual: vector.len(),
            });
        }

        Ok(vector)
    }
}

impl Embedder for HttpEmbedder {
    fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, SearchError> {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.embed_blocking(text))
            }
            _ => self.embed_blocking(text),
        }
    }
}

fn pool_response(payload: EmbeddingResponse) -> Result<Vec<f32>, SearchError> {
    match payload {
        EmbeddingResponse::Object { embedding } => Ok(embedding),
        EmbeddingResponse::Pooled(vector) => Ok(vector),
        EmbeddingResponse::Tokens(tokens) => {
            let width = tokens.first().map(Vec::len).unwrap_or(0);
            if width == 0 || tokens.iter().any(|token| token.len() != width) {
                return Err(SearchError::BackendResponse {
                    backend: "embedding".to_string(),
                    details: "token embeddings are empty or ragged".to_string(),
                });
            }

            let mut pooled = vec![0f32; width];
            for token in &tokens {
                for (slot, value) in pooled.iter_mut().zip(token) {
                    *slot += value;
                }
            }
            let count = tokens.len() as f32;
            Ok(pooled.into_iter().map(|value| value / count).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_is_deterministic() -> Result<(), SearchError> {
        let embedder = HashedNgramEmbedder::default();
        let first = embedder.embed("Patient admitted for severe chest pain")?;
        let second = embedder.embed("Patient admitted for severe chest pain")?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn embedder_outputs_unit_vectors_of_configured_length() -> Result<(), SearchError> {
        let embedder = HashedNgramEmbedder { dimensions: 32 };
        let vector = embedder.embed("MRI scan shows no abnormalities")?;
        assert_eq!(vector.len(), 32);
        let norm = vector.iter().map(|value| value * value).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() -> Result<(), SearchError> {
        let vector = HashedNgramEmbedder::default().embed("  ...  ")?;
        assert!(vector.iter().all(|value| *value == 0.0));
        Ok(())
    }

    #[test]
    fn token_embeddings_are_mean_pooled() -> Result<(), SearchError> {
        let payload: EmbeddingResponse = serde_json::from_str("[[1.0, 2.0], [3.0, 4.0]]")?;
        assert_eq!(pool_response(payload)?, vec![2.0, 3.0]);

        let payload: EmbeddingResponse = serde_json::from_str(r#"{"embedding": [0.5, 0.25]}"#)?;
        assert_eq!(pool_response(payload)?, vec![0.5, 0.25]);
        Ok(())
    }

    #[test]
    fn ragged_token_embeddings_are_rejected() -> Result<(), SearchError> {
        let payload: EmbeddingResponse = serde_json::from_str("[[1.0, 2.0], [3.0]]")?;
        assert!(pool_response(payload).is_err());
        Ok(())
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let result = HttpEmbedder::new(EmbeddingEndpointConfig {
            endpoint: "not a url".to_string(),
            api_key: None,
            dimensions: 768,
        });
        assert!(matches!(result, Err(SearchError::Url(_))));
    }
}
