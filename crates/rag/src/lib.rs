pub mod answer;
pub mod builder;
pub mod cache;
pub mod config;
pub mod embedding;
pub mod error;
pub mod session;
pub mod store;
pub mod usage;

pub use answer::{Answerer, RetrievalAnswerer};
pub use builder::ChunkEmbedBuilder;
pub use cache::{DocumentBuilder, DocumentCache, Processed};
pub use config::{AppConfig, FileConfig, QuotaLimits};
pub use embedding::{EmbeddingBackend, EmbeddingClient};
pub use error::{RagError, Result};
pub use session::{open_session, ActiveDocument, AskOutcome, DefaultSession, QaSession, UploadOutcome};
pub use store::{DocumentStore, DocumentSummary, SaveOutcome, SqliteDocumentStore, StoreSummary};
pub use usage::{Clock, ScopeUsage, SystemClock, UsageReport, UsageTracker, UsageWindow, WindowScope};
pub use minirag_llm::{LlmClient, LlmProvider, LlmRequest, LlmResponse};
