use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

const BLOB_MAGIC: &[u8; 4] = b"MRIX";
const BLOB_VERSION: u8 = 1;
const ZSTD_LEVEL: i32 = 3;

/// A vector index that can be written to and restored from an opaque blob.
/// Storage layers never look inside the bytes.
pub trait IndexBlob: Sized {
    fn to_blob(&self) -> Result<Vec<u8>>;
    fn from_blob(bytes: &[u8]) -> Result<Self>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub text: String,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub position: usize,
    pub score: f32,
    pub text: String,
}

/// Brute-force cosine index over chunk embeddings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatIndex {
    dimensions: usize,
    entries: Vec<IndexEntry>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: Vec::new(),
        }
    }

    pub fn from_parts(texts: Vec<String>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if texts.len() != vectors.len() {
            return Err(CoreError::IndexCodec(format!(
                "{} texts but {} vectors",
                texts.len(),
                vectors.len()
            )));
        }
        let dimensions = vectors.first().map(|v| v.len()).unwrap_or(0);
        let mut index = Self::new(dimensions);
        for (text, vector) in texts.into_iter().zip(vectors) {
            index.push(text, vector)?;
        }
        Ok(index)
    }

    pub fn push(&mut self, text: String, vector: Vec<f32>) -> Result<()> {
        check_dimensions(self.dimensions, vector.len())?;
        self.entries.push(IndexEntry { text, vector });
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn texts(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.text.as_str())
    }

    pub fn search(&self, query: &[f32], top_k: usize) -> Result<Vec<ScoredChunk>> {
        if self.entries.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        check_dimensions(self.dimensions, query.len())?;
        let mut hits: Vec<ScoredChunk> = self
            .entries
            .iter()
            .enumerate()
            .map(|(position, entry)| ScoredChunk {
                position,
                score: cosine_similarity(query, &entry.vector),
                text: entry.text.clone(),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        hits.truncate(top_k);
        Ok(hits)
    }
}

impl IndexBlob for FlatIndex {
    fn to_blob(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let compressed = zstd::encode_all(payload.as_slice(), ZSTD_LEVEL)?;
        let mut blob = Vec::with_capacity(compressed.len() + 5);
        blob.extend_from_slice(BLOB_MAGIC);
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&compressed);
        Ok(blob)
    }

    fn from_blob(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 5 || &bytes[..4] != BLOB_MAGIC {
            return Err(CoreError::IndexCodec("missing index header".to_string()));
        }
        if bytes[4] != BLOB_VERSION {
            return Err(CoreError::IndexCodec(format!(
                "unsupported index version {}",
                bytes[4]
            )));
        }
        let payload = zstd::decode_all(&bytes[5..])?;
        let index: FlatIndex = bincode::deserialize(&payload)?;
        for entry in &index.entries {
            check_dimensions(index.dimensions, entry.vector.len())?;
        }
        Ok(index)
    }
}

fn check_dimensions(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(CoreError::DimensionMismatch { expected, actual });
    }
    Ok(())
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut a_norm = 0.0f32;
    let mut b_norm = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        a_norm += x * x;
        b_norm += y * y;
    }
    if a_norm == 0.0 || b_norm == 0.0 {
        return 0.0;
    }
    dot / (a_norm.sqrt() * b_norm.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlatIndex {
        FlatIndex::from_parts(
            vec!["north".into(), "east".into(), "north-east".into()],
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.7, 0.7]],
        )
        .unwrap()
    }

    #[test]
    fn search_ranks_by_cosine() {
        let hits = sample().search(&[1.0, 0.1], 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text, "north");
        assert_eq!(hits[1].text, "north-east");
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let err = FlatIndex::from_parts(
            vec!["a".into(), "b".into()],
            vec![vec![1.0, 0.0], vec![1.0]],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::DimensionMismatch {
                expected: 2,
                actual: 1
            }
        ));
        assert!(sample().search(&[1.0], 1).is_err());
    }

    #[test]
    fn blob_restores_the_same_index() {
        let index = sample();
        let restored = FlatIndex::from_blob(&index.to_blob().unwrap()).unwrap();
        assert_eq!(restored, index);
    }

    #[test]
    fn corrupt_blobs_are_codec_errors() {
        assert!(matches!(
            FlatIndex::from_blob(b"nope"),
            Err(CoreError::IndexCodec(_))
        ));
        let mut blob = sample().to_blob().unwrap();
        blob[4] = 9;
        assert!(FlatIndex::from_blob(&blob).is_err());
        let blob = sample().to_blob().unwrap();
        assert!(FlatIndex::from_blob(&blob[..blob.len() / 2]).is_err());
    }
}
