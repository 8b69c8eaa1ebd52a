use minirag_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("no document supplied")]
    EmptyDocument,
    #[error("no question supplied")]
    EmptyQuestion,
    #[error("no document has been uploaded yet")]
    NoDocument,
    #[error("document processing failed")]
    Build(#[source] anyhow::Error),
    #[error("answering failed")]
    Answer(#[source] anyhow::Error),
    #[error("store error")]
    Store(#[source] anyhow::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl RagError {
    /// True when the caller sent something unusable, as opposed to a
    /// collaborator or storage failure.
    pub fn is_input_error(&self) -> bool {
        match self {
            RagError::EmptyDocument | RagError::EmptyQuestion | RagError::NoDocument => true,
            RagError::Build(err) => matches!(
                err.downcast_ref::<CoreError>(),
                Some(CoreError::UnsupportedInput(_)) | Some(CoreError::EmptyText)
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
