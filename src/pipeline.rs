//! The submission pipeline: workspace, rasterize, OCR, aggregate.

use std::{sync::Arc, time::Duration};

use crate::{
    aggregate::aggregate,
    dispatch::{DispatchSettings, OcrDispatcher},
    error::SubmissionError,
    limiter::Limiter,
    ocr::OcrEngine,
    page_key::MAX_PAGE_KEY,
    prelude::*,
    rasterize::{Rasterizer, rasterize_document},
    submission::{DocumentKind, Submission, SubmissionStatus, Upload},
    workspace::{Workspace, WorkspaceManager, WorkspaceRetention},
};

/// Everything a [`Pipeline`] needs to know, other than its collaborators.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Directory holding one workspace per submission.
    pub workspace_dir: PathBuf,

    /// What to do with workspaces when a submission finishes.
    pub retention: WorkspaceRetention,

    /// Longest document we accept, in pages.
    pub max_pages: usize,

    /// Deadline for a whole submission, including queueing for permits.
    pub submission_timeout: Duration,

    /// Settings for the OCR stage.
    pub dispatch: DispatchSettings,
}

impl PipelineConfig {
    /// Check for settings we can't honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_pages == 0 {
            return Err(anyhow!("max pages must be at least 1"));
        }
        if self.max_pages > MAX_PAGE_KEY {
            return Err(anyhow!(
                "max pages is {}, but page names only have room for {}",
                self.max_pages,
                MAX_PAGE_KEY
            ));
        }
        if self.submission_timeout.is_zero() || self.dispatch.page_timeout.is_zero() {
            return Err(anyhow!("timeouts must be greater than zero"));
        }
        if self.dispatch.language.trim().is_empty() {
            return Err(anyhow!("OCR language must not be empty"));
        }
        Ok(())
    }
}

/// Runs submissions end to end.
///
/// One `Pipeline` is shared by every submission in the process, and so is the
/// OCR [`Limiter`] inside it.
pub struct Pipeline {
    workspaces: WorkspaceManager,
    rasterizer: Arc<dyn Rasterizer>,
    dispatcher: OcrDispatcher,
    ocr_limiter: Limiter,
    cpu_limiter: Limiter,
    retention: WorkspaceRetention,
    max_pages: usize,
    submission_timeout: Duration,
}

impl Pipeline {
    /// Build a pipeline around the process-wide OCR limiter.
    pub fn new(
        config: PipelineConfig,
        rasterizer: Arc<dyn Rasterizer>,
        engine: Arc<dyn OcrEngine>,
        ocr_limiter: Limiter,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            workspaces: WorkspaceManager::new(config.workspace_dir),
            rasterizer,
            dispatcher: OcrDispatcher::new(engine, ocr_limiter.clone(), config.dispatch),
            ocr_limiter,
            cpu_limiter: Limiter::for_cpus("rasterizer"),
            retention: config.retention,
            max_pages: config.max_pages,
            submission_timeout: config.submission_timeout,
        })
    }

    /// The shared OCR limiter.
    pub fn ocr_limiter(&self) -> &Limiter {
        &self.ocr_limiter
    }

    /// Where workspaces are created.
    pub fn workspace_dir(&self) -> &Path {
        self.workspaces.base_dir()
    }

    /// Process one uploaded document of the given kind.
    ///
    /// Workspace, storage, and rasterizer failures abort the submission. OCR
    /// failures on individual pages don't; they show up on the affected
    /// pages, and in [`Submission::status`].
    #[instrument(level = "info", name = "submission", skip_all, fields(file_name = %upload.file_name, %kind))]
    pub async fn process(
        &self,
        upload: Upload,
        kind: DocumentKind,
    ) -> Result<Submission, SubmissionError> {
        let extension = upload.detect_expecting(kind)?;
        let workspace = self
            .workspaces
            .allocate()
            .await
            .map_err(SubmissionError::Resource)?;
        info!(
            id = %workspace.id(),
            root = %workspace.root().display(),
            bytes = upload.data.len(),
            "Storing submitted document"
        );

        // Dropping `run` on timeout aborts any OCR still in flight.
        let result = tokio::time::timeout(
            self.submission_timeout,
            self.run(&workspace, &upload, kind, extension),
        )
        .await
        .unwrap_or(Err(SubmissionError::Timeout(self.submission_timeout)));

        match &result {
            Ok(submission) => info!(
                id = %submission.id,
                pages = submission.page_count,
                failed_pages = submission.failed_pages().count(),
                "Submission complete"
            ),
            Err(err) => error!(id = %workspace.id(), "Submission failed: {}", err),
        }
        workspace.finish(self.retention).await;
        result
    }

    async fn run(
        &self,
        workspace: &Workspace,
        upload: &Upload,
        kind: DocumentKind,
        extension: &'static str,
    ) -> Result<Submission, SubmissionError> {
        let image_extension = match kind {
            DocumentKind::Pdf => {
                let document = workspace
                    .persist_document(extension, &upload.data)
                    .await
                    .map_err(SubmissionError::Resource)?;
                rasterize_document(
                    &self.rasterizer,
                    &self.cpu_limiter,
                    workspace,
                    &document,
                    self.max_pages,
                )
                .await?;
                self.rasterizer.image_extension()
            }
            DocumentKind::Image => {
                workspace
                    .persist_page_image(extension, &upload.data)
                    .await
                    .map_err(SubmissionError::Resource)?;
                extension
            }
        };

        let report = self
            .dispatcher
            .dispatch_all(&workspace.images_dir(), image_extension, &workspace.texts_dir())
            .await
            .map_err(SubmissionError::Resource)?;
        let pages = aggregate(&workspace.texts_dir(), report.page_count())
            .await
            .map_err(SubmissionError::Resource)?;

        Ok(Submission {
            id: workspace.id().to_owned(),
            file_name: upload.file_name.clone(),
            kind,
            page_count: pages.len(),
            status: SubmissionStatus::for_pages(&pages),
            pages,
        })
    }
}
