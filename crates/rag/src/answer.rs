use anyhow::{anyhow, Result};
use minirag_core::{FlatIndex, ScoredChunk};
use minirag_llm::{LlmClient, LlmRequest};
use tracing::debug;

use crate::embedding::EmbeddingClient;

const CONTEXT_START: &str = "=== CONTEXT START ===";
const CONTEXT_END: &str = "=== CONTEXT END ===";

/// Produces an answer to `question` grounded in a document's index.
pub trait Answerer<I>: Send + Sync {
    fn answer(&self, question: &str, index: &I) -> Result<String>;
}

impl<F, I> Answerer<I> for F
where
    F: Fn(&str, &I) -> Result<String> + Send + Sync,
{
    fn answer(&self, question: &str, index: &I) -> Result<String> {
        self(question, index)
    }
}

/// Embeds the question, pulls the `top_k` closest chunks and asks the model
/// to answer from them alone.
pub struct RetrievalAnswerer {
    embeddings: EmbeddingClient,
    llm: LlmClient,
    top_k: usize,
}

impl RetrievalAnswerer {
    pub fn new(embeddings: EmbeddingClient, llm: LlmClient, top_k: usize) -> Self {
        Self {
            embeddings,
            llm,
            top_k: top_k.max(1),
        }
    }

    pub fn llm(&self) -> &LlmClient {
        &self.llm
    }
}

impl Answerer<FlatIndex> for RetrievalAnswerer {
    fn answer(&self, question: &str, index: &FlatIndex) -> Result<String> {
        let query = self.embeddings.embed(question)?;
        let hits = index.search(&query, self.top_k)?;
        if hits.is_empty() {
            return Err(anyhow!("document has no indexed chunks"));
        }
        debug!(
            hits = hits.len(),
            best = hits[0].score,
            model = self.llm.model(),
            "retrieved context"
        );
        let response = self.llm.chat_blocking(&LlmRequest {
            system: None,
            user: build_prompt(question, &hits),
        })?;
        debug!(
            prompt_tokens = response.prompt_tokens,
            completion_tokens = response.completion_tokens,
            total_tokens = response.total_tokens(),
            "completion received"
        );
        let answer = response.content.trim();
        if answer.is_empty() {
            return Err(anyhow!(
                "{} returned an empty answer",
                self.llm.provider().as_str()
            ));
        }
        Ok(answer.to_string())
    }
}

fn build_prompt(question: &str, hits: &[ScoredChunk]) -> String {
    let mut prompt = String::from(
        "You are a helpful assistant. Answer only with the information in CONTEXT.\n\n",
    );
    prompt.push_str(CONTEXT_START);
    prompt.push('\n');
    for hit in hits {
        prompt.push_str(&format!("[chunk {}]\n{}\n\n", hit.position, hit.text));
    }
    prompt.push_str(CONTEXT_END);
    prompt.push_str(&format!("\n\nQuestion: {}\nAnswer:", question.trim()));
    prompt
}
