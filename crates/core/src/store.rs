use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::models::ChunkMetadata;
use crate::vector_index::FlatL2Index;
use chrono::Utc;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone)]
pub struct StoreReport {
    pub index_path: PathBuf,
    pub text_store_path: PathBuf,
    pub chunk_count: usize,
    pub dimension: usize,
}

pub fn index_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.index"))
}

pub fn text_store_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

pub fn embed_all<E: Embedder + ?Sized>(
    embedder: &E,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, SearchError> {
    texts.iter().map(|text| embedder.embed(text)).collect()
}

/// Embeds `texts`, writes the flat index to `<name>.index` and the chunk texts
/// to `<name>.json` under `dir`. Position `i` in the index is chunk `i`.
pub fn store_in_index<E: Embedder + ?Sized>(
    dir: &Path,
    name: &str,
    embedder: &E,
    texts: &[String],
) -> Result<StoreReport, SearchError> {
    info!(chunk_count = texts.len(), name, "embedding chunks for flat index");

    let embeddings = embed_all(embedder, texts)?;
    let mut index = FlatL2Index::new(embedder.dimensions());
    index.add(&embeddings)?;

    fs::create_dir_all(dir)?;
    let index_path = index_path(dir, name);
    index.write_to(&index_path)?;

    let text_store_path = text_store_path(dir, name);
    write_pretty_json(&text_store_path, texts)?;

    info!(
        chunk_count = texts.len(),
        index = %index_path.display(),
        texts = %text_store_path.display(),
        "stored chunks"
    );

    Ok(StoreReport {
        index_path,
        text_store_path,
        chunk_count: texts.len(),
        dimension: index.dimension(),
    })
}

pub fn load_index(dir: &Path, name: &str) -> Result<FlatL2Index, SearchError> {
    FlatL2Index::read_from(&index_path(dir, name))
}

pub fn load_text_store(dir: &Path, name: &str) -> Result<Vec<String>, SearchError> {
    let raw = fs::read_to_string(text_store_path(dir, name))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Loads the index and text store for `name`, rejecting pairs whose lengths
/// disagree.
pub fn load_aligned(dir: &Path, name: &str) -> Result<(FlatL2Index, Vec<String>), SearchError> {
    let index = load_index(dir, name)?;
    let texts = load_text_store(dir, name)?;

    if index.len() != texts.len() {
        return Err(SearchError::Misaligned {
            vectors: index.len(),
            texts: texts.len(),
        });
    }

    Ok((index, texts))
}

pub fn save_metadata(
    file_name: &str,
    chunks: &[String],
    dir: &Path,
    source_checksum: Option<String>,
) -> Result<PathBuf, SearchError> {
    let metadata = ChunkMetadata {
        num_chunks: chunks.len(),
        chunks: chunks.to_vec(),
        source_checksum,
        created_at: Utc::now(),
    };

    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{file_name}_metadata.json"));
    let json = serde_json::to_string_pretty(&metadata)?;
    fs::write(&path, json)?;
    Ok(path)
}

fn write_pretty_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), SearchError> {
    let mut buffer = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut buffer, PrettyFormatter::with_indent(b"    "));
    value.serialize(&mut serializer)?;
    fs::write(path, buffer)?;
    Ok(())
}
