use anyhow::{Context, Result};
use minirag_core::{extract_text, FlatIndex, TextSplitter};
use tracing::info;

use crate::cache::DocumentBuilder;
use crate::embedding::EmbeddingClient;

/// Extract, split and embed a document into a [`FlatIndex`].
pub struct ChunkEmbedBuilder {
    splitter: TextSplitter,
    embeddings: EmbeddingClient,
}

impl ChunkEmbedBuilder {
    pub fn new(splitter: TextSplitter, embeddings: EmbeddingClient) -> Self {
        Self {
            splitter,
            embeddings,
        }
    }

    pub fn embeddings(&self) -> &EmbeddingClient {
        &self.embeddings
    }
}

impl DocumentBuilder for ChunkEmbedBuilder {
    type Index = FlatIndex;

    fn build(&self, raw: &[u8]) -> Result<(Vec<String>, FlatIndex)> {
        let text = extract_text(raw)?;
        let chunks = self.splitter.split(&text);
        let vectors = self
            .embeddings
            .embed_batch(&chunks)
            .context("failed to embed chunks")?;
        let index = FlatIndex::from_parts(chunks.clone(), vectors)?;
        info!(
            chars = text.chars().count(),
            chunks = chunks.len(),
            embedder = %self.embeddings.describe(),
            "document indexed"
        );
        Ok((chunks, index))
    }

    /// An index built with a different embedding width cannot answer queries
    /// from this client. Empty indices and unknown widths are accepted.
    fn accepts(&self, index: &FlatIndex) -> bool {
        match self.embeddings.dimensions() {
            Some(width) => index.is_empty() || index.dimensions() == width,
            None => true,
        }
    }
}
