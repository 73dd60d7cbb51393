//! Command-line entry points.

use std::{sync::Arc, time::Duration};

use clap::Args;

use crate::{
    dispatch::DispatchSettings,
    limiter::Limiter,
    ocr::tesseract::TesseractOcrEngine,
    pipeline::{Pipeline, PipelineConfig},
    prelude::*,
    rasterize::ghostscript::GhostscriptRasterizer,
    workspace::WorkspaceRetention,
};

pub mod scan;
pub mod schema;
pub mod serve;

/// Pipeline settings shared by `serve` and `scan`.
#[derive(Debug, Clone, Args)]
pub struct PipelineOpts {
    /// Directory for per-submission workspaces. Defaults to a `docscan`
    /// directory under the system temporary directory.
    #[clap(long = "workspace-dir", env = "UPLOADED_FILES_DIR")]
    workspace_dir: Option<PathBuf>,

    /// Max OCR engine calls running at once, across all submissions.
    #[clap(long = "ocr-jobs", env = "OCR_JOBS", default_value = "4")]
    ocr_jobs: usize,

    /// Tesseract language code(s), like `eng` or `eng+ita`.
    #[clap(long, env = "OCR_LANGUAGE", default_value = "eng")]
    language: String,

    /// Resolution used when rendering PDF pages.
    #[clap(long, env = "RASTERIZE_DPI", default_value = "300")]
    rasterize_dpi: u32,

    /// Ghostscript binary.
    #[clap(long, env = "GHOSTSCRIPT", default_value = "gs")]
    ghostscript: PathBuf,

    /// Tesseract binary.
    #[clap(long, env = "TESSERACT", default_value = "tesseract")]
    tesseract: PathBuf,

    /// Reject PDFs with more pages than this.
    #[clap(long, env = "MAX_PAGES", default_value = "5000")]
    max_pages: usize,

    /// Give up on a single page after this many seconds.
    #[clap(long = "page-timeout", env = "PAGE_TIMEOUT_SECS", default_value = "120")]
    page_timeout_secs: u64,

    /// Give up on a whole submission after this many seconds.
    #[clap(
        long = "submission-timeout",
        env = "SUBMISSION_TIMEOUT_SECS",
        default_value = "600"
    )]
    submission_timeout_secs: u64,

    /// Leave workspaces on disk after each submission.
    #[clap(long, env = "KEEP_WORKSPACES")]
    keep_workspaces: bool,

    /// Return OCR text with its line breaks, instead of joining lines with
    /// spaces.
    #[clap(long)]
    keep_newlines: bool,

    /// Treat a page with no recognized text as a failed page.
    #[clap(long)]
    empty_text_is_error: bool,
}

impl PipelineOpts {
    /// Build a pipeline using Ghostscript and Tesseract, with a fresh OCR
    /// limiter for this process.
    pub fn build(&self) -> Result<Pipeline> {
        if self.rasterize_dpi == 0 {
            return Err(anyhow!("--rasterize-dpi must be at least 1"));
        }
        let ocr_limiter = Limiter::new("ocr", self.ocr_jobs).context("invalid --ocr-jobs")?;

        // Ghostscript is given absolute output paths, so the workspace
        // directory must be absolute too.
        let workspace_dir = self
            .workspace_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("docscan"));
        let workspace_dir = std::path::absolute(&workspace_dir).with_context(|| {
            format!("cannot resolve workspace directory {:?}", workspace_dir.display())
        })?;

        let config = PipelineConfig {
            workspace_dir,
            retention: if self.keep_workspaces {
                WorkspaceRetention::Keep
            } else {
                WorkspaceRetention::Delete
            },
            max_pages: self.max_pages,
            submission_timeout: Duration::from_secs(self.submission_timeout_secs),
            dispatch: DispatchSettings {
                language: self.language.clone(),
                page_timeout: Duration::from_secs(self.page_timeout_secs),
                collapse_newlines: !self.keep_newlines,
                empty_text_is_error: self.empty_text_is_error,
            },
        };
        debug!(?config, "Pipeline configuration");
        Pipeline::new(
            config,
            Arc::new(GhostscriptRasterizer::new(&self.ghostscript, self.rasterize_dpi)),
            Arc::new(TesseractOcrEngine::new(&self.tesseract)),
            ocr_limiter,
        )
        .context("invalid pipeline configuration")
    }
}
