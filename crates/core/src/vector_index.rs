//! Exhaustive L2 nearest-neighbour index over fixed-dimension `f32` vectors.
//!
//! File layout (little endian): the 8-byte magic `MRFLATL2`, a `u32` format
//! version, a `u32` dimension, a `u64` vector count, then `count * dimension`
//! `f32` components in insertion order.

use crate::error::SearchError;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

const MAGIC: &[u8; 8] = b"MRFLATL2";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatL2Index {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), SearchError> {
        if let Some(bad) = vectors.iter().find(|vector| vector.len() != self.dimension) {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimension,
                actual: bad.len(),
            });
        }

        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector);
        }
        Ok(())
    }

    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Returns up to `k` `(position, squared L2 distance)` pairs, nearest first.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(usize, f32)>, SearchError> {
        if query.len() != self.dimension {
            return Err(SearchError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut distances = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(position, stored)| (position, squared_l2(query, stored)))
            .collect::<Vec<_>>();

        distances.sort_by(|left, right| left.1.total_cmp(&right.1).then(left.0.cmp(&right.0)));
        distances.truncate(k);
        Ok(distances)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SearchError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&(self.dimension as u32).to_le_bytes())?;
        writer.write_all(&(self.len() as u64).to_le_bytes())?;
        for value in &self.data {
            writer.write_all(&value.to_le_bytes())?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, SearchError> {
        let mut reader = BufReader::new(File::open(path)?);
        let format_error = |details: &str| SearchError::IndexFormat {
            path: path.display().to_string(),
            details: details.to_string(),
        };

        let mut magic = [0u8; 8];
        read_exact_or(&mut reader, &mut magic, || format_error("missing header"))?;
        if &magic != MAGIC {
            return Err(format_error("bad magic"));
        }

        let mut word = [0u8; 4];
        read_exact_or(&mut reader, &mut word, || format_error("missing version"))?;
        let version = u32::from_le_bytes(word);
        if version != FORMAT_VERSION {
            return Err(format_error(&format!("unsupported version {version}")));
        }

        read_exact_or(&mut reader, &mut word, || format_error("missing dimension"))?;
        let dimension = u32::from_le_bytes(word) as usize;

        let mut long = [0u8; 8];
        read_exact_or(&mut reader, &mut long, || format_error("missing count"))?;
        let count = usize::try_from(u64::from_le_bytes(long))
            .map_err(|_| format_error("vector count overflows usize"))?;

        let expected_bytes = count
            .checked_mul(dimension)
            .and_then(|values| values.checked_mul(4))
            .ok_or_else(|| format_error("vector payload size overflows"))?;

        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        if payload.len() != expected_bytes {
            return Err(format_error(&format!(
                "expected {expected_bytes} payload bytes, found {}",
                payload.len()
            )));
        }

        let data = payload
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect();

        Ok(Self { dimension, data })
    }
}

fn read_exact_or<R: Read>(
    reader: &mut R,
    buffer: &mut [u8],
    on_eof: impl FnOnce() -> SearchError,
) -> Result<(), SearchError> {
    match reader.read_exact(buffer) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => Err(on_eof()),
        Err(error) => Err(SearchError::Io(error)),
    }
}

fn squared_l2(left: &[f32], right: &[f32]) -> f32 {
    left.iter()
        .zip(right)
        .map(|(a, b)| {
            let delta = a - b;
            delta * delta
        })
        .sum()
}
