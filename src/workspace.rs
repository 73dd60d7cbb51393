//! Per-submission scratch directories.
//!
//! Every submission gets `{base}/{id}/`, laid out as:
//!
//! ```text
//! {id}/document.<ext>     the upload, as received
//! {id}/images/            one image per page
//! {id}/texts/             one text or error artifact per page
//! ```
//!
//! Keeping these apart means the aggregator can list `texts/` without
//! filtering out the source document or the page images.

use std::{io, time::Duration};

use tokio::fs;
use uuid::Uuid;

use crate::{page_key::PageKey, prelude::*};

/// How many fresh ids we try before giving up on a collision.
const MAX_ALLOCATE_ATTEMPTS: usize = 3;

/// How many times we try to remove a workspace.
const MAX_REMOVE_ATTEMPTS: u32 = 5;

/// Backoff between removal attempts, multiplied by the attempt number.
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(25);

/// Base name of the stored upload.
const DOCUMENT_STEM: &str = "document";

/// Subdirectory holding page images.
const IMAGES_DIR: &str = "images";

/// Subdirectory holding per-page OCR artifacts.
const TEXTS_DIR: &str = "texts";

/// What to do with a workspace once its submission is finished.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WorkspaceRetention {
    /// Remove the workspace as soon as the result has been built.
    #[default]
    Delete,
    /// Leave the workspace on disk, for debugging.
    Keep,
}

/// Creates workspaces under a base directory.
#[derive(Clone, Debug)]
pub struct WorkspaceManager {
    base_dir: PathBuf,
}

impl WorkspaceManager {
    /// Create a manager. The base directory is created on first use.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// The directory all workspaces live under.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Create a fresh, empty workspace with a new unique id.
    #[instrument(level = "debug", skip_all, fields(base_dir = %self.base_dir.display()))]
    pub async fn allocate(&self) -> Result<Workspace> {
        fs::create_dir_all(&self.base_dir).await.with_context(|| {
            format!(
                "failed to create workspace base directory {:?}",
                self.base_dir.display()
            )
        })?;

        for attempt in 1..=MAX_ALLOCATE_ATTEMPTS {
            let id = Uuid::new_v4().to_string();
            let root = self.base_dir.join(&id);
            // `create_dir` rather than `create_dir_all`, so that a collision
            // with an existing workspace is an error instead of a silent share.
            match fs::create_dir(&root).await {
                Ok(()) => {
                    let workspace = Workspace { id, root };
                    workspace.create_subdirs().await?;
                    debug!(id = %workspace.id, "Allocated workspace");
                    return Ok(workspace);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    warn!(id = %id, attempt, "Workspace id already in use, retrying");
                }
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("failed to create workspace {:?}", root.display())
                    });
                }
            }
        }
        Err(anyhow!(
            "could not find an unused workspace id after {} attempts",
            MAX_ALLOCATE_ATTEMPTS
        ))
    }
}

/// A directory tree owned by exactly one submission.
#[derive(Debug)]
pub struct Workspace {
    id: String,
    root: PathBuf,
}

impl Workspace {
    /// The submission id, which is also the directory name.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The root of the workspace.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where page images go.
    pub fn images_dir(&self) -> PathBuf {
        self.root.join(IMAGES_DIR)
    }

    /// Where per-page OCR artifacts go.
    pub fn texts_dir(&self) -> PathBuf {
        self.root.join(TEXTS_DIR)
    }

    /// Where the original upload is stored.
    pub fn document_path(&self, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", DOCUMENT_STEM, extension))
    }

    async fn create_subdirs(&self) -> Result<()> {
        for dir in [self.images_dir(), self.texts_dir()] {
            fs::create_dir(&dir)
                .await
                .with_context(|| format!("failed to create {:?}", dir.display()))?;
        }
        Ok(())
    }

    /// Store the uploaded document, returning its path.
    pub async fn persist_document(&self, extension: &str, data: &[u8]) -> Result<PathBuf> {
        let path = self.document_path(extension);
        fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {:?}", path.display()))?;
        Ok(path)
    }

    /// Store an uploaded image as the one and only page image.
    pub async fn persist_page_image(&self, extension: &str, data: &[u8]) -> Result<PathBuf> {
        let key = PageKey::new(1)?;
        let path = self.images_dir().join(key.image_file_name(extension));
        fs::write(&path, data)
            .await
            .with_context(|| format!("failed to write {:?}", path.display()))?;
        Ok(path)
    }

    /// Throw away everything in the images directory, leaving it empty.
    pub async fn clear_images(&self) -> Result<()> {
        let dir = self.images_dir();
        fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("failed to clear {:?}", dir.display()))?;
        fs::create_dir(&dir)
            .await
            .with_context(|| format!("failed to recreate {:?}", dir.display()))?;
        Ok(())
    }

    /// Delete the workspace and everything in it.
    ///
    /// Page tasks that were aborted by a timeout may still be finishing a
    /// blocking write into `texts/`, which makes removal fail with a
    /// non-empty directory. So we retry a few times before giving up.
    pub async fn remove(self) -> Result<()> {
        let mut attempt = 1;
        loop {
            let err = match fs::remove_dir_all(&self.root).await {
                Ok(()) => return Ok(()),
                // A previous attempt got everything after all.
                Err(err) if attempt > 1 && err.kind() == io::ErrorKind::NotFound => {
                    return Ok(());
                }
                Err(err) => err,
            };
            if attempt >= MAX_REMOVE_ATTEMPTS || err.kind() == io::ErrorKind::NotFound {
                return Err(err).with_context(|| {
                    format!("failed to remove workspace {:?}", self.root.display())
                });
            }
            warn!(id = %self.id, attempt, "Retrying workspace removal: {}", err);
            tokio::time::sleep(REMOVE_RETRY_DELAY * attempt).await;
            attempt += 1;
        }
    }

    /// Apply a retention policy, logging rather than failing on errors, since
    /// the submission itself is already complete.
    pub async fn finish(self, retention: WorkspaceRetention) {
        match retention {
            WorkspaceRetention::Keep => {
                debug!(id = %self.id, root = %self.root.display(), "Keeping workspace");
            }
            WorkspaceRetention::Delete => {
                let id = self.id.clone();
                if let Err(err) = self.remove().await {
                    error!(id = %id, "failed to delete workspace: {:?}", err);
                }
            }
        }
    }
}
