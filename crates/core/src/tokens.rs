use tiktoken_rs::CoreBPE;

use crate::error::{CoreError, Result};

/// Estimates how many tokens one question/answer exchange consumed.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, question: &str, answer: &str) -> u64;
}

/// Whitespace word count of both sides plus a fixed prompt overhead.
#[derive(Debug, Clone, Copy)]
pub struct WordCountEstimator {
    pub overhead: u64,
}

impl Default for WordCountEstimator {
    fn default() -> Self {
        Self { overhead: 50 }
    }
}

impl TokenEstimator for WordCountEstimator {
    fn estimate(&self, question: &str, answer: &str) -> u64 {
        let words = question.split_whitespace().count() + answer.split_whitespace().count();
        words as u64 + self.overhead
    }
}

#[derive(Debug, Clone)]
pub enum TokenizerKind {
    Cl100k,
    O200k,
}

impl TokenizerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "cl100k" | "cl100k_base" => Some(Self::Cl100k),
            "o200k" | "o200k_base" => Some(Self::O200k),
            _ => None,
        }
    }

    pub fn build(&self) -> Result<CoreBPE> {
        match self {
            TokenizerKind::Cl100k => {
                tiktoken_rs::cl100k_base().map_err(|e| CoreError::Tokenizer(e.to_string()))
            }
            TokenizerKind::O200k => {
                tiktoken_rs::o200k_base().map_err(|e| CoreError::Tokenizer(e.to_string()))
            }
        }
    }
}

/// BPE token count of both sides plus the same fixed overhead.
pub struct BpeEstimator {
    bpe: CoreBPE,
    overhead: u64,
}

impl BpeEstimator {
    pub fn new(kind: &TokenizerKind) -> Result<Self> {
        Ok(Self {
            bpe: kind.build()?,
            overhead: WordCountEstimator::default().overhead,
        })
    }
}

impl TokenEstimator for BpeEstimator {
    fn estimate(&self, question: &str, answer: &str) -> u64 {
        let count = self.bpe.encode_with_special_tokens(question).len()
            + self.bpe.encode_with_special_tokens(answer).len();
        count as u64 + self.overhead
    }
}
