//! Page ordering keys embedded in artifact file names.
//!
//! Pages are processed concurrently and finish in any order, so every file we
//! write for a page carries its page number in its name. A key looks like
//! `p000042`: a `p` prefix and the 1-based page number padded to
//! [`PAGE_KEY_WIDTH`] digits. Keys are always parsed back into numbers before
//! sorting, so names narrower or wider than the padding still order correctly.

use std::fmt;

use crate::prelude::*;

/// Prefix shared by every page key.
const PAGE_KEY_PREFIX: &str = "p";

/// How many digits we pad page numbers to.
pub const PAGE_KEY_WIDTH: usize = 6;

/// The largest page number that fits in [`PAGE_KEY_WIDTH`] digits.
pub const MAX_PAGE_KEY: usize = 999_999;

/// Suffix for a page's extracted text.
const TEXT_SUFFIX: &str = "_text.txt";

/// Suffix for a page's recorded OCR failure.
const ERROR_SUFFIX: &str = "_error.txt";

/// The position of a page within a document. Always 1-based.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageKey(usize);

impl PageKey {
    /// Create a key for a 1-based page number.
    pub fn new(page_number: usize) -> Result<Self> {
        if page_number == 0 {
            return Err(anyhow!("page numbers start at 1"));
        }
        Ok(Self(page_number))
    }

    /// The 1-based page number.
    pub fn page_number(self) -> usize {
        self.0
    }

    /// Parse a key from a file stem like `p000001`.
    ///
    /// Returns `None` for anything that isn't a key, including page 0.
    pub fn parse(stem: &str) -> Option<Self> {
        let digits = stem.strip_prefix(PAGE_KEY_PREFIX)?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match digits.parse::<usize>() {
            Ok(0) | Err(_) => None,
            Ok(n) => Some(Self(n)),
        }
    }

    /// Parse the key from an image path, like `images/p000003.jpg`.
    pub fn from_image_path(path: &Path) -> Option<Self> {
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(Self::parse)
    }

    /// The file name of a page image with this key.
    pub fn image_file_name(self, extension: &str) -> String {
        format!("{}.{}", self, extension)
    }

    /// The file name holding this page's extracted text.
    pub fn text_file_name(self) -> String {
        format!("{}{}", self, TEXT_SUFFIX)
    }

    /// The file name holding this page's OCR failure.
    pub fn error_file_name(self) -> String {
        format!("{}{}", self, ERROR_SUFFIX)
    }

    /// An output file pattern for Ghostscript, which numbers pages from 1.
    pub fn ghostscript_pattern(extension: &str) -> String {
        format!("{}%0{}d.{}", PAGE_KEY_PREFIX, PAGE_KEY_WIDTH, extension)
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:0width$}", PAGE_KEY_PREFIX, self.0, width = PAGE_KEY_WIDTH)
    }
}

/// What kind of per-page artifact a file in the text directory is.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Extracted text.
    Text,
    /// A recorded OCR failure.
    Error,
}

/// Parse a text-directory file name into its key and kind.
pub fn parse_artifact_name(file_name: &str) -> Option<(PageKey, ArtifactKind)> {
    if let Some(stem) = file_name.strip_suffix(TEXT_SUFFIX) {
        PageKey::parse(stem).map(|key| (key, ArtifactKind::Text))
    } else if let Some(stem) = file_name.strip_suffix(ERROR_SUFFIX) {
        PageKey::parse(stem).map(|key| (key, ArtifactKind::Error))
    } else {
        None
    }
}

/// Fail if a document with `page_count` pages can't be keyed, or exceeds the
/// configured `max_pages`.
pub fn check_capacity(page_count: usize, max_pages: usize) -> Result<()> {
    let limit = max_pages.min(MAX_PAGE_KEY);
    if page_count > limit {
        Err(anyhow!(
            "document has more than {} pages, which is the most we accept",
            limit
        ))
    } else {
        Ok(())
    }
}
