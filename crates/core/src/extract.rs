use tracing::debug;

use crate::error::{CoreError, Result};

const PDF_MAGIC: &[u8] = b"%PDF";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Pdf,
    PlainText,
}

pub fn detect_kind(bytes: &[u8]) -> Result<InputKind> {
    if bytes.is_empty() {
        return Err(CoreError::UnsupportedInput("empty payload"));
    }
    if bytes.starts_with(PDF_MAGIC) {
        return Ok(InputKind::Pdf);
    }
    if std::str::from_utf8(bytes).is_ok() {
        return Ok(InputKind::PlainText);
    }
    Err(CoreError::UnsupportedInput("payload is neither a pdf nor utf-8 text"))
}

/// Pulls the text layer out of an uploaded document. PDF pages are
/// concatenated in order; plain UTF-8 payloads pass through untouched.
pub fn extract_text(bytes: &[u8]) -> Result<String> {
    let text = match detect_kind(bytes)? {
        InputKind::Pdf => {
            let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
                .map_err(|e| CoreError::Pdf(e.to_string()))?;
            debug!(pages = pages.len(), "extracted pdf text layer");
            pages.join("\n")
        }
        InputKind::PlainText => String::from_utf8_lossy(bytes).into_owned(),
    };
    if text.trim().is_empty() {
        return Err(CoreError::EmptyText);
    }
    Ok(text)
}
