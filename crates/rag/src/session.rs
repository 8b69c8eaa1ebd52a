use std::sync::Arc;

use minirag_core::{Fingerprint, TextSplitter, TokenEstimator, WordCountEstimator};
use minirag_llm::LlmClient;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::answer::{Answerer, RetrievalAnswerer};
use crate::builder::ChunkEmbedBuilder;
use crate::cache::{DocumentBuilder, DocumentCache};
use crate::config::AppConfig;
use crate::embedding::EmbeddingClient;
use crate::error::{RagError, Result};
use crate::store::{DocumentStore, SqliteDocumentStore};
use crate::usage::{UsageReport, UsageTracker};

/// The document questions are currently answered against.
#[derive(Debug)]
pub struct ActiveDocument<I> {
    pub fingerprint: Fingerprint,
    pub chunks: Vec<String>,
    pub index: I,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadOutcome {
    pub fingerprint: Fingerprint,
    pub chunk_count: usize,
    pub was_cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskOutcome {
    pub answer: String,
    pub estimated_tokens: u64,
    pub usage: UsageReport,
}

/// Upload-then-ask workflow over one shared cache and one global quota.
pub struct QaSession<S, B: DocumentBuilder, A> {
    cache: DocumentCache<S>,
    builder: B,
    answerer: A,
    usage: UsageTracker,
    estimator: Box<dyn TokenEstimator>,
    current: RwLock<Option<Arc<ActiveDocument<B::Index>>>>,
}

impl<S, B, A> QaSession<S, B, A>
where
    S: DocumentStore,
    B: DocumentBuilder,
    A: Answerer<B::Index>,
{
    pub fn new(cache: DocumentCache<S>, builder: B, answerer: A, usage: UsageTracker) -> Self {
        Self {
            cache,
            builder,
            answerer,
            usage,
            estimator: Box::new(WordCountEstimator::default()),
            current: RwLock::new(None),
        }
    }

    pub fn with_estimator(mut self, estimator: Box<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn cache(&self) -> &DocumentCache<S> {
        &self.cache
    }

    pub fn upload(&self, raw: &[u8]) -> Result<UploadOutcome> {
        let processed = self.cache.process(raw, &self.builder)?;
        let outcome = UploadOutcome {
            fingerprint: processed.fingerprint,
            chunk_count: processed.chunks.len(),
            was_cached: processed.was_cached,
            cache_warning: processed.cache_warning,
        };
        *self.current.write() = Some(Arc::new(ActiveDocument {
            fingerprint: processed.fingerprint,
            chunks: processed.chunks,
            index: processed.index,
        }));
        info!(
            fingerprint = %outcome.fingerprint,
            chunks = outcome.chunk_count,
            cached = outcome.was_cached,
            "document ready"
        );
        Ok(outcome)
    }

    /// Answers against the current document. Usage is only recorded for
    /// answers that were actually produced.
    pub fn ask(&self, question: &str) -> Result<AskOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(RagError::EmptyQuestion);
        }
        let document = self.current().ok_or(RagError::NoDocument)?;
        let answer = self
            .answerer
            .answer(question, &document.index)
            .map_err(RagError::Answer)?;
        let estimated_tokens = self.estimator.estimate(question, &answer);
        let usage = self.usage.record(estimated_tokens);
        info!(
            fingerprint = %document.fingerprint,
            estimated_tokens,
            minute_requests = usage.minute.used_requests,
            "question answered"
        );
        Ok(AskOutcome {
            answer,
            estimated_tokens,
            usage,
        })
    }

    pub fn usage(&self) -> UsageReport {
        self.usage.snapshot()
    }

    pub fn current(&self) -> Option<Arc<ActiveDocument<B::Index>>> {
        self.current.read().clone()
    }
}

pub type DefaultSession = QaSession<SqliteDocumentStore, ChunkEmbedBuilder, RetrievalAnswerer>;

/// Wires the sqlite store, configured embedder and LLM client into a session.
pub fn open_session(config: &AppConfig) -> Result<DefaultSession> {
    let store =
        SqliteDocumentStore::open(&config.db_path, &config.index_dir).map_err(RagError::Store)?;
    let embeddings =
        EmbeddingClient::from_env().map_err(|err| RagError::Config(format!("{err:#}")))?;
    let llm = LlmClient::new(config.provider, config.model.clone()).map_err(|err| {
        RagError::Config(format!(
            "failed to configure {} client: {err:#}",
            config.provider.as_str()
        ))
    })?;
    let builder = ChunkEmbedBuilder::new(
        TextSplitter::with_sizes(config.chunk_size, config.chunk_overlap),
        embeddings.clone(),
    );
    let answerer = RetrievalAnswerer::new(embeddings, llm, config.top_k);
    Ok(QaSession::new(
        DocumentCache::new(store),
        builder,
        answerer,
        UsageTracker::new(config.quota),
    ))
}
