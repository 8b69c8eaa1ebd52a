mod embedding;
mod error;
mod extract;
mod fingerprint;
mod index;
mod splitter;
mod tokens;

pub use embedding::{normalize, HashEmbedder, HashEmbedderConfig};
pub use error::{CoreError, Result};
pub use extract::{detect_kind, extract_text, InputKind};
pub use fingerprint::Fingerprint;
pub use index::{cosine_similarity, FlatIndex, IndexBlob, IndexEntry, ScoredChunk};
pub use splitter::{SplitterConfig, TextSplitter};
pub use tokens::{BpeEstimator, TokenEstimator, TokenizerKind, WordCountEstimator};
