//! Submissions, pages, and the result records we return.

use std::fmt;

use schemars::JsonSchema;

use crate::{error::SubmissionError, prelude::*};

/// Image MIME types we accept as single-page uploads.
const SUPPORTED_IMAGE_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/tiff",
    "image/bmp",
    "image/webp",
    "image/gif",
];

/// What kind of document was uploaded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// A PDF, which we rasterize into one image per page.
    Pdf,
    /// A single image, which is OCRed as page 1.
    Image,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Pdf => write!(f, "pdf"),
            DocumentKind::Image => write!(f, "image"),
        }
    }
}

/// An uploaded document, before any processing.
#[derive(Clone, Debug)]
pub struct Upload {
    /// The name the caller gave us. Diagnostics only; never used as a path.
    pub file_name: String,
    /// The raw document.
    pub data: Vec<u8>,
}

impl Upload {
    /// Sniff the content type, and work out which kind of document this is
    /// and which file extension to store it with.
    pub fn detect(&self) -> Result<(DocumentKind, &'static str), SubmissionError> {
        let ty = infer::get(&self.data).ok_or_else(|| {
            SubmissionError::Unsupported(format!(
                "could not identify the contents of {:?}",
                self.file_name
            ))
        })?;
        let mime_type = ty.mime_type();
        if mime_type == "application/pdf" {
            Ok((DocumentKind::Pdf, "pdf"))
        } else if SUPPORTED_IMAGE_TYPES.contains(&mime_type) {
            Ok((DocumentKind::Image, ty.extension()))
        } else {
            Err(SubmissionError::Unsupported(format!(
                "{:?} is {}, expected a PDF or an image",
                self.file_name, mime_type
            )))
        }
    }

    /// Like [`Upload::detect`], but the caller has already said which kind of
    /// document to expect.
    pub fn detect_expecting(
        &self,
        expected: DocumentKind,
    ) -> Result<&'static str, SubmissionError> {
        let (kind, extension) = self.detect()?;
        if kind == expected {
            Ok(extension)
        } else {
            Err(SubmissionError::Unsupported(format!(
                "{:?} is a {} but a {} was expected",
                self.file_name, kind, expected
            )))
        }
    }
}

/// How well a submission went.
#[derive(Clone, Copy, Debug, JsonSchema, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    // Every page has text.
    Ok,

    // Some pages failed to OCR.
    Incomplete,

    // Every page failed to OCR.
    Failed,
}

impl SubmissionStatus {
    /// Summarize a list of pages.
    pub fn for_pages(pages: &[Page]) -> Self {
        let failed = pages.iter().filter(|p| p.error.is_some()).count();
        if failed == 0 {
            SubmissionStatus::Ok
        } else if failed < pages.len() {
            SubmissionStatus::Incomplete
        } else {
            SubmissionStatus::Failed
        }
    }
}

/// One page of a processed document.
#[derive(Clone, Debug, JsonSchema, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Page {
    /// The 1-based page number.
    pub page_number: usize,

    /// The text extracted from the page. Empty if OCR failed.
    pub text: String,

    /// Why OCR failed for this page, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Page {
    /// A page with text.
    pub fn ok(page_number: usize, text: String) -> Self {
        Self {
            page_number,
            text,
            error: None,
        }
    }

    /// A page which could not be OCRed.
    pub fn failed(page_number: usize, error: impl Into<String>) -> Self {
        Self {
            page_number,
            text: String::new(),
            error: Some(error.into()),
        }
    }
}

/// The result of processing one uploaded document.
#[derive(Clone, Debug, JsonSchema, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Submission {
    /// Unique ID of this submission. Also the name of its workspace.
    pub id: String,

    /// The file name supplied by the caller.
    pub file_name: String,

    /// What kind of document was processed.
    pub kind: DocumentKind,

    /// How many pages the document had.
    pub page_count: usize,

    /// Whether every page was OCRed.
    pub status: SubmissionStatus,

    /// The pages, in order.
    pub pages: Vec<Page>,
}

impl Submission {
    /// Pages which failed to OCR.
    pub fn failed_pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter().filter(|p| p.error.is_some())
    }
}
