//! Errors that abort a whole submission.
//!
//! OCR failures on individual pages are not errors at this level. They are
//! recorded on the affected [`crate::submission::Page`] and the rest of the
//! document is still returned.

use std::time::Duration;

use thiserror::Error;

/// A fatal error for one submission.
#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The workspace could not be created, written, or read.
    #[error("workspace error: {0:#}")]
    Resource(#[source] anyhow::Error),

    /// The rasterizer failed, so there are no pages to OCR.
    #[error("could not convert document to page images: {0:#}")]
    Conversion(#[source] anyhow::Error),

    /// The document has more pages than we accept.
    #[error("{0:#}")]
    Capacity(#[source] anyhow::Error),

    /// The upload isn't a document we know how to process.
    #[error("unsupported document: {0}")]
    Unsupported(String),

    /// The submission ran past its deadline.
    #[error("submission did not finish within {0:?}")]
    Timeout(Duration),
}

impl SubmissionError {
    /// Should the caller expect the same request to succeed if retried?
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Resource(_) | Self::Timeout(_))
    }
}
