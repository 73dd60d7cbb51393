//! Reassembling per-page OCR artifacts into an ordered list of pages.

use std::collections::BTreeMap;

use tokio::fs;

use crate::{
    page_key::{ArtifactKind, parse_artifact_name},
    prelude::*,
    submission::Page,
};

/// Error recorded for a page slot with no artifact at all.
const MISSING_OUTPUT: &str = "no OCR output for page";

/// Read every artifact in `text_dir` and build one [`Page`] per slot.
///
/// Pages are ordered by the key in each artifact's name, never by directory
/// order. There are exactly `expected_pages` slots, numbered from 1. A slot
/// with no readable text gets an error instead of being dropped, so later
/// pages keep their numbers. Artifacts for pages past `expected_pages` are
/// ignored.
#[instrument(level = "debug", skip_all, fields(text_dir = %text_dir.display()))]
pub async fn aggregate(text_dir: &Path, expected_pages: usize) -> Result<Vec<Page>> {
    let mut artifacts = BTreeMap::new();
    let mut out_of_range = 0;
    let mut entries = fs::read_dir(text_dir)
        .await
        .with_context(|| format!("failed to read directory {:?}", text_dir.display()))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read entry in {:?}", text_dir.display()))?
    {
        let file_name = entry.file_name();
        let parsed = file_name.to_str().and_then(parse_artifact_name);
        let Some((key, kind)) = parsed else {
            debug!(file = ?file_name, "Ignoring file that is not a page artifact");
            continue;
        };
        if key.page_number() > expected_pages {
            out_of_range += 1;
            continue;
        }
        // If a page somehow has both, the failure wins.
        let slot = artifacts
            .entry(key.page_number())
            .or_insert((kind, entry.path()));
        if kind == ArtifactKind::Error {
            *slot = (kind, entry.path());
        }
    }

    if out_of_range > 0 {
        warn!(
            expected_pages,
            ignored = out_of_range,
            "Ignoring artifacts for pages past the end of the document"
        );
    }

    let mut pages = Vec::with_capacity(expected_pages);
    for page_number in 1..=expected_pages {
        let page = match artifacts.remove(&page_number) {
            None => Page::failed(page_number, MISSING_OUTPUT),
            Some((kind, path)) => match (kind, fs::read(&path).await) {
                (ArtifactKind::Text, Ok(bytes)) => {
                    Page::ok(page_number, String::from_utf8_lossy(&bytes).into_owned())
                }
                (ArtifactKind::Error, Ok(bytes)) => {
                    Page::failed(page_number, String::from_utf8_lossy(&bytes).into_owned())
                }
                (_, Err(err)) => {
                    error!(path = %path.display(), "Cannot read page artifact: {}", err);
                    Page::failed(page_number, format!("cannot read OCR output: {}", err))
                }
            },
        };
        pages.push(page);
    }
    Ok(pages)
}
