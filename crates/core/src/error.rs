use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported input: {0}")]
    UnsupportedInput(&'static str),
    #[error("document contains no extractable text")]
    EmptyText,
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("index codec error: {0}")]
    IndexCodec(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl From<bincode::Error> for CoreError {
    fn from(value: bincode::Error) -> Self {
        Self::IndexCodec(value.to_string())
    }
}
