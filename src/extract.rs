//! Page text extraction.
//!
//! Turns stored bytes into ordered per-page text. PDFs go through
//! `pdf-extract`; plain text is split into pages on form feeds (`\x0c`).
//! Pages without text come back as empty strings so page numbers stay
//! aligned with the source.

use async_trait::async_trait;

use crate::error::{Error, Result, Service};

#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract_pages(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>>;
}

/// Guess a content type from a blob key's extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = key
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "pdf" => "application/pdf",
        "md" | "markdown" => "text/markdown",
        _ => "text/plain",
    }
}

/// Handles `application/pdf` and any `text/*` type.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPageExtractor;

#[async_trait]
impl PageExtractor for DefaultPageExtractor {
    async fn extract_pages(&self, bytes: &[u8], content_type: &str) -> Result<Vec<String>> {
        match content_type {
            "application/pdf" => {
                let owned = bytes.to_vec();
                // pdf-extract is CPU-bound and can panic on malformed input.
                tokio::task::spawn_blocking(move || extract_pdf_pages(&owned))
                    .await
                    .map_err(|e| Error::external(Service::Extraction, e))?
            }
            t if t.starts_with("text/") => Ok(split_text_pages(bytes)),
            other => Err(Error::Validation(format!(
                "unsupported content type: {}",
                other
            ))),
        }
    }
}

fn extract_pdf_pages(bytes: &[u8]) -> Result<Vec<String>> {
    pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| Error::external(Service::Extraction, format!("PDF: {}", e)))
}

pub fn split_text_pages(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .split('\x0c')
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_text_pages_split_on_form_feed() {
        let pages = DefaultPageExtractor
            .extract_pages(b"one\x0c\x0cthree", "text/plain")
            .await
            .unwrap();
        assert_eq!(pages, vec!["one", "", "three"]);
    }

    #[tokio::test]
    async fn test_unsupported_content_type() {
        let err = DefaultPageExtractor
            .extract_pages(b"", "application/zip")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_invalid_pdf_is_extraction_error() {
        let err = DefaultPageExtractor
            .extract_pages(b"not a pdf", "application/pdf")
            .await
            .unwrap_err();
        assert_eq!(err.service(), Some(Service::Extraction));
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("a/b/Statute.PDF"), "application/pdf");
        assert_eq!(content_type_for("notes.md"), "text/markdown");
        assert_eq!(content_type_for("no-extension"), "text/plain");
    }
}
