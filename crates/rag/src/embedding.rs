use std::env;

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client;
use serde::Deserialize;
use tracing::debug;

use minirag_core::{HashEmbedder, HashEmbedderConfig};

const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
const OPENAI_BATCH: usize = 96;

#[derive(Clone)]
pub enum EmbeddingBackend {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbeddingClient),
}

/// Embeds chunk and question text with whichever backend is configured.
/// Documents must be queried with the same backend they were indexed with.
#[derive(Clone)]
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// `EMBEDDING_PROVIDER` = `hash` (default) or `openai`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let provider = lookup("EMBEDDING_PROVIDER").unwrap_or_else(|| "hash".to_string());
        let backend = match provider.trim().to_lowercase().as_str() {
            "hash" => {
                let defaults = HashEmbedderConfig::default();
                let dimensions = match lookup("HASH_EMBED_DIMENSIONS") {
                    Some(raw) => raw
                        .trim()
                        .parse::<usize>()
                        .ok()
                        .filter(|dims| *dims > 0)
                        .ok_or_else(|| anyhow!("HASH_EMBED_DIMENSIONS must be a positive integer"))?,
                    None => defaults.dimensions,
                };
                EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig {
                    dimensions,
                    ..defaults
                }))
            }
            "openai" => {
                let api_key = lookup("OPENAI_API_KEY")
                    .ok_or_else(|| anyhow!("OPENAI_API_KEY is required for openai embeddings"))?;
                EmbeddingBackend::OpenAi(OpenAiEmbeddingClient::new(
                    api_key,
                    lookup("EMBEDDING_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
                    lookup("OPENAI_BASE_URL")
                        .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                ))
            }
            other => bail!("unknown embedding provider {other}"),
        };
        Ok(Self { backend })
    }

    pub fn hash() -> Self {
        Self {
            backend: EmbeddingBackend::Hash(HashEmbedder::new(HashEmbedderConfig::default())),
        }
    }

    pub fn describe(&self) -> String {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => format!("hash/{}", embedder.dimensions()),
            EmbeddingBackend::OpenAi(client) => format!("openai/{}", client.model),
        }
    }

    /// Width of the vectors this client produces, when it is known up front.
    pub fn dimensions(&self) -> Option<usize> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Some(embedder.dimensions()),
            EmbeddingBackend::OpenAi(client) => openai_dimensions(&client.model),
        }
    }

    pub fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::Hash(embedder) => Ok(embedder.embed_batch(inputs)),
            EmbeddingBackend::OpenAi(client) => {
                let mut vectors = Vec::with_capacity(inputs.len());
                for batch in inputs.chunks(OPENAI_BATCH) {
                    vectors.extend(client.embed_batch(batch)?);
                }
                Ok(vectors)
            }
        }
    }

    pub fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])?
            .pop()
            .ok_or_else(|| anyhow!("embedding backend returned no vector"))
    }
}

#[derive(Clone)]
pub struct OpenAiEmbeddingClient {
    http: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl OpenAiEmbeddingClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: Client::new(),
            model,
            api_key,
            base_url,
        }
    }

    fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": self.model,
                "input": inputs,
            }))
            .send()
            .context("openai embeddings request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            bail!("openai embeddings returned {status}: {body}");
        }
        let parsed: EmbeddingsResponse = response
            .json()
            .context("failed to decode openai embeddings response")?;
        debug!(inputs = inputs.len(), model = %self.model, "embedded batch");
        order_embeddings(parsed.data, inputs.len())
    }
}

fn openai_dimensions(model: &str) -> Option<usize> {
    match model {
        "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
        "text-embedding-3-large" => Some(3072),
        _ => None,
    }
}

/// The API tags each vector with its input position; reassemble in input
/// order and insist every input got exactly one vector.
fn order_embeddings(data: Vec<EmbeddingData>, expected: usize) -> Result<Vec<Vec<f32>>> {
    let mut slots: Vec<Option<Vec<f32>>> = vec![None; expected];
    for item in data {
        let slot = slots
            .get_mut(item.index)
            .ok_or_else(|| anyhow!("embedding index {} out of range", item.index))?;
        *slot = Some(item.embedding);
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(idx, slot)| slot.ok_or_else(|| anyhow!("no embedding returned for input {idx}")))
        .collect()
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn hash_backend_embeds_every_input() {
        let client = EmbeddingClient::hash();
        let inputs = vec!["quarterly revenue".to_string(), "head count".to_string()];
        let vectors = client.embed_batch(&inputs).unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 384));
        assert_eq!(client.embed("quarterly revenue").unwrap(), vectors[0]);
        assert_eq!(client.describe(), "hash/384");
        assert_eq!(client.dimensions(), Some(384));
    }

    #[test]
    fn provider_selection_from_settings() {
        let client = EmbeddingClient::from_lookup(&lookup(&[("HASH_EMBED_DIMENSIONS", "64")])).unwrap();
        assert_eq!(client.describe(), "hash/64");

        let client = EmbeddingClient::from_lookup(&lookup(&[
            ("EMBEDDING_PROVIDER", "OpenAI"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(client.describe(), "openai/text-embedding-3-small");
        assert_eq!(client.dimensions(), Some(1536));

        let client = EmbeddingClient::from_lookup(&lookup(&[
            ("EMBEDDING_PROVIDER", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
            ("EMBEDDING_MODEL", "in-house-embedder"),
        ]))
        .unwrap();
        assert_eq!(client.dimensions(), None);

        assert!(EmbeddingClient::from_lookup(&lookup(&[("EMBEDDING_PROVIDER", "openai")])).is_err());
        assert!(EmbeddingClient::from_lookup(&lookup(&[("EMBEDDING_PROVIDER", "word2vec")])).is_err());
        assert!(EmbeddingClient::from_lookup(&lookup(&[("HASH_EMBED_DIMENSIONS", "0")])).is_err());
    }

    #[test]
    fn embeddings_are_reordered_by_index() {
        let data = vec![
            EmbeddingData { index: 1, embedding: vec![2.0] },
            EmbeddingData { index: 0, embedding: vec![1.0] },
        ];
        assert_eq!(order_embeddings(data, 2).unwrap(), vec![vec![1.0], vec![2.0]]);

        let short = vec![EmbeddingData { index: 0, embedding: vec![1.0] }];
        assert!(order_embeddings(short, 2).is_err());
        let stray = vec![EmbeddingData { index: 5, embedding: vec![1.0] }];
        assert!(order_embeddings(stray, 1).is_err());
    }
}
