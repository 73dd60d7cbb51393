//! Turning documents into one image per page.
//!
//! The actual rendering is done by an external tool behind the [`Rasterizer`]
//! trait. [`rasterize_document`] wraps it with the things every submission
//! needs: a CPU permit, page counting, a page limit, and cleanup of partial
//! output on failure.

use std::sync::Arc;

use tokio::fs;

use crate::{
    error::SubmissionError,
    limiter::Limiter,
    page_key::{self, MAX_PAGE_KEY, PageKey},
    prelude::*,
    workspace::Workspace,
};

pub mod ghostscript;

/// What to rasterize, and where to put it.
#[derive(Debug)]
pub struct RasterizeRequest<'a> {
    /// The document to render.
    pub source: &'a Path,

    /// An existing, empty directory for the page images. Always absolute.
    pub output_dir: &'a Path,

    /// Stop after this page, even if the document is longer.
    pub last_page: usize,
}

/// Interface to an external rasterizer.
///
/// Implementations must name their output with [`PageKey`]s, so that page
/// `n` is written to `p{n:06}.{image_extension}` in the output directory.
#[async_trait]
pub trait Rasterizer: Send + Sync + 'static {
    /// The extension of the images we produce, without a dot.
    fn image_extension(&self) -> &'static str;

    /// Render each page of `request.source` into `request.output_dir`.
    async fn rasterize(&self, request: &RasterizeRequest<'_>) -> Result<()>;
}

/// List the page images in a directory, in page order.
///
/// Subdirectories and files with other extensions are skipped. Files with the
/// right extension but a name that isn't a page key are skipped with a warning.
pub async fn list_page_images(dir: &Path, extension: &str) -> Result<Vec<(PageKey, PathBuf)>> {
    let mut entries = fs::read_dir(dir)
        .await
        .with_context(|| format!("failed to read directory {:?}", dir.display()))?;
    let mut images = vec![];
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("failed to read entry in {:?}", dir.display()))?
    {
        let path = entry.path();
        let file_type = entry
            .file_type()
            .await
            .with_context(|| format!("failed to stat {:?}", path.display()))?;
        if !file_type.is_file() || !has_extension(&path, extension) {
            continue;
        }
        match PageKey::from_image_path(&path) {
            Some(key) => images.push((key, path)),
            None => warn!(path = %path.display(), "Skipping image without a page key"),
        }
    }
    // Directory listings come back in whatever order the platform likes.
    images.sort_by_key(|(key, _)| *key);
    Ok(images)
}

/// Check that sorted page images are numbered exactly `1..=n`, one image per
/// page.
///
/// Two names can parse to the same key (`p1.jpg` and `p000001.jpg`), and a
/// stray file can leave a gap. Either way the page numbers would no longer
/// match the images we OCR.
pub fn check_page_sequence(images: &[(PageKey, PathBuf)]) -> Result<()> {
    for (index, (key, path)) in images.iter().enumerate() {
        let expected = index + 1;
        let found = key.page_number();
        if found > MAX_PAGE_KEY {
            return Err(anyhow!(
                "page image {:?} is numbered past the last allowed page {}",
                path.display(),
                MAX_PAGE_KEY
            ));
        }
        if found == expected {
            continue;
        }
        if index > 0 && images[index - 1].0 == *key {
            return Err(anyhow!(
                "page images {:?} and {:?} are both page {}",
                images[index - 1].1.display(),
                path.display(),
                found
            ));
        }
        return Err(anyhow!(
            "missing page image for page {} (next image is {:?})",
            expected,
            path.display()
        ));
    }
    Ok(())
}

/// Does `path` end in `.extension`, ignoring case?
pub fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Rasterize an uploaded document into the workspace's images directory,
/// returning the number of pages produced.
///
/// On any failure the images directory is emptied before returning, so that
/// nothing downstream can pick up a partial rendering.
#[instrument(level = "debug", skip_all, fields(id = %workspace.id()))]
pub async fn rasterize_document(
    rasterizer: &Arc<dyn Rasterizer>,
    cpu_limiter: &Limiter,
    workspace: &Workspace,
    source: &Path,
    max_pages: usize,
) -> Result<usize, SubmissionError> {
    let result = rasterize_and_count(rasterizer, cpu_limiter, workspace, source, max_pages).await;
    if result.is_err() {
        if let Err(err) = workspace.clear_images().await {
            error!(id = %workspace.id(), "failed to discard partial page images: {:?}", err);
        }
    }
    result
}

async fn rasterize_and_count(
    rasterizer: &Arc<dyn Rasterizer>,
    cpu_limiter: &Limiter,
    workspace: &Workspace,
    source: &Path,
    max_pages: usize,
) -> Result<usize, SubmissionError> {
    let output_dir = workspace.images_dir();
    let request = RasterizeRequest {
        source,
        output_dir: &output_dir,
        // One page past the limit, so we can tell "exactly at the limit"
        // apart from "over the limit" without rendering the whole document.
        last_page: max_pages.saturating_add(1),
    };

    // Rasterizers use at least a whole CPU each, and we don't want to run 200
    // copies of one at once by mistake.
    cpu_limiter
        .run(|| rasterizer.rasterize(&request))
        .await
        .map_err(SubmissionError::Conversion)?;

    let images = list_page_images(&output_dir, rasterizer.image_extension())
        .await
        .map_err(SubmissionError::Resource)?;
    let page_count = images.len();
    page_key::check_capacity(page_count, max_pages).map_err(SubmissionError::Capacity)?;
    if page_count == 0 {
        return Err(SubmissionError::Conversion(anyhow!(
            "rasterizer produced no pages for {:?}",
            source.display()
        )));
    }
    check_page_sequence(&images).map_err(SubmissionError::Conversion)?;
    info!(id = %workspace.id(), page_count, "Rasterized document");
    Ok(page_count)
}
