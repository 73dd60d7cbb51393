//! Parallel OCR over a directory of page images.
//!
//! [`OcrDispatcher::dispatch_all`] starts one task per page image. Tasks run
//! concurrently and finish in any order, but every task draws a permit from
//! the shared OCR [`Limiter`] first, so the total number of engine calls in
//! flight across *all* submissions stays bounded. Each task writes its result
//! to a file named after its [`PageKey`], and also reports it back into a
//! slot indexed by page position, so no result depends on completion order.
//!
//! A failing, panicking, or hanging engine call only affects its own page.

use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt as _;
use tokio::{fs, task::JoinSet};

use crate::{
    limiter::Limiter,
    ocr::{OcrEngine, collapse_newlines},
    page_key::PageKey,
    prelude::*,
    rasterize::{check_page_sequence, list_page_images},
};

/// Settings shared by every page task.
#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Language hint passed through to the engine, like `eng` or `eng+deu`.
    pub language: String,

    /// How long a single engine call may take.
    pub page_timeout: Duration,

    /// Replace line breaks in the output with spaces.
    pub collapse_newlines: bool,

    /// Treat a page with no text as a failure rather than a blank page.
    pub empty_text_is_error: bool,
}

/// What happened to one page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageOutcome {
    /// Which page this is.
    pub key: PageKey,

    /// Why OCR failed, if it did.
    pub error: Option<String>,
}

/// The result of [`OcrDispatcher::dispatch_all`], in page order.
#[derive(Debug, Default)]
pub struct DispatchReport {
    pub outcomes: Vec<PageOutcome>,
}

impl DispatchReport {
    /// How many page images were dispatched.
    pub fn page_count(&self) -> usize {
        self.outcomes.len()
    }

    /// How many pages failed.
    pub fn failed_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Runs the OCR engine over directories of page images.
#[derive(Clone)]
pub struct OcrDispatcher {
    engine: Arc<dyn OcrEngine>,
    limiter: Limiter,
    settings: Arc<DispatchSettings>,
}

impl OcrDispatcher {
    /// Create a dispatcher. `limiter` should be the process-wide OCR limiter.
    pub fn new(engine: Arc<dyn OcrEngine>, limiter: Limiter, settings: DispatchSettings) -> Self {
        Self {
            engine,
            limiter,
            settings: Arc::new(settings),
        }
    }

    /// OCR every image in `image_dir` ending in `.extension`, writing one
    /// artifact per page into `text_dir`. Returns once every page is done.
    ///
    /// It is an error if `image_dir` can't be listed, or if its images aren't
    /// numbered exactly `1..=n`. Both are checked before any OCR starts. Page
    /// failures are recorded in the report and as `<key>_error.txt` artifacts.
    ///
    /// If this future is dropped, every page task is aborted and its permit
    /// returned.
    #[instrument(level = "debug", skip_all, fields(image_dir = %image_dir.display()))]
    pub async fn dispatch_all(
        &self,
        image_dir: &Path,
        extension: &str,
        text_dir: &Path,
    ) -> Result<DispatchReport> {
        let images = list_page_images(image_dir, extension).await?;
        check_page_sequence(&images)?;
        info!(
            pages = images.len(),
            max_concurrency = self.limiter.capacity(),
            free_permits = self.limiter.available(),
            "Launching OCR tasks"
        );

        let mut slots: Vec<Option<PageOutcome>> = vec![None; images.len()];
        let mut tasks = JoinSet::new();
        for (index, (key, image)) in images.iter().cloned().enumerate() {
            let dispatcher = self.clone();
            let text_dir = text_dir.to_owned();
            tasks.spawn(async move {
                let outcome = dispatcher.ocr_page(key, image, &text_dir).await;
                (index, outcome)
            });
        }

        // Wait for every task.
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => error!("OCR task did not complete: {}", err),
            }
        }

        let outcomes = slots
            .into_iter()
            .zip(images)
            .map(|(slot, (key, _))| {
                slot.unwrap_or_else(|| PageOutcome {
                    key,
                    error: Some("OCR task did not complete".to_owned()),
                })
            })
            .collect::<Vec<_>>();
        let report = DispatchReport { outcomes };
        for outcome in &report.outcomes {
            if let Some(error) = &outcome.error {
                debug!(page = %outcome.key, "No text for page: {}", error);
            }
        }
        info!(
            pages = report.page_count(),
            failed = report.failed_count(),
            "OCR tasks finished"
        );
        Ok(report)
    }

    /// OCR one page while holding a permit, and record the result on disk.
    #[instrument(level = "debug", skip_all, fields(page = %key))]
    async fn ocr_page(&self, key: PageKey, image: PathBuf, text_dir: &Path) -> PageOutcome {
        let permit = match self.limiter.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                return PageOutcome {
                    key,
                    error: Some(format!("{:#}", err)),
                };
            }
        };

        let recognized = self.recognize_guarded(&image).await;
        let error = record_page(key, text_dir, recognized).await;

        // Give the permit back before reporting that we're done.
        drop(permit);
        PageOutcome { key, error }
    }

    /// Call the engine with a deadline, turning panics into errors.
    async fn recognize_guarded(&self, image: &Path) -> Result<String> {
        let call = AssertUnwindSafe(self.engine.recognize(image, &self.settings.language))
            .catch_unwind();
        let text = match tokio::time::timeout(self.settings.page_timeout, call).await {
            Err(_elapsed) => {
                return Err(anyhow!(
                    "OCR did not finish within {:?}",
                    self.settings.page_timeout
                ));
            }
            Ok(Err(panic)) => {
                return Err(anyhow!("OCR engine panicked: {}", panic_message(&*panic)));
            }
            Ok(Ok(result)) => result?,
        };

        let text = if self.settings.collapse_newlines {
            collapse_newlines(&text)
        } else {
            text
        };
        if text.trim().is_empty() {
            if self.settings.empty_text_is_error {
                return Err(anyhow!("OCR engine found no text"));
            }
            debug!(image = %image.display(), "OCR engine found no text");
        }
        Ok(text)
    }
}

/// Write a page's text, or its failure, to `text_dir`. Returns the failure
/// message, if any.
async fn record_page(key: PageKey, text_dir: &Path, recognized: Result<String>) -> Option<String> {
    let failure = match recognized {
        Ok(text) => {
            let path = text_dir.join(key.text_file_name());
            match fs::write(&path, text).await {
                Ok(()) => return None,
                Err(err) => format!("failed to write {:?}: {}", path.display(), err),
            }
        }
        Err(err) => format!("{:#}", err),
    };

    warn!(page = %key, "OCR failed: {}", failure);
    let path = text_dir.join(key.error_file_name());
    if let Err(err) = fs::write(&path, &failure).await {
        error!(page = %key, "failed to record OCR failure in {:?}: {}", path.display(), err);
    }
    Some(failure)
}

/// Get a printable message out of a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_owned()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_owned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{aggregate::aggregate, ocr::fakes::FakeOcrEngine};

    pub(crate) fn settings() -> DispatchSettings {
        DispatchSettings {
            language: "eng".to_owned(),
            page_timeout: Duration::from_secs(30),
            collapse_newlines: true,
            empty_text_is_error: false,
        }
    }

    /// Later pages finish first, and neighbours finish out of order.
    fn shuffled_delay(page: usize) -> Duration {
        Duration::from_millis(((40 - page % 40) * 7 % 23) as u64)
    }

    /// A scratch directory with `images/` holding `pages` page images and an
    /// empty `texts/`.
    fn scratch(pages: usize) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let images = dir.path().join("images");
        let texts = dir.path().join("texts");
        std::fs::create_dir(&images).unwrap();
        std::fs::create_dir(&texts).unwrap();
        for n in 1..=pages {
            let key = PageKey::new(n).unwrap();
            std::fs::write(images.join(key.image_file_name("jpg")), b"jpg").unwrap();
        }
        (dir, images, texts)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn output_order_is_stable_under_shuffled_completion() -> Result<()> {
        for pages in [0, 1, 7, 25] {
            let (_dir, images, texts) = scratch(pages);
            let engine = Arc::new(FakeOcrEngine {
                delay: Some(shuffled_delay),
                ..FakeOcrEngine::default()
            });
            let dispatcher = OcrDispatcher::new(engine, Limiter::new("ocr", 4)?, settings());
            let report = dispatcher.dispatch_all(&images, "jpg", &texts).await?;
            assert_eq!(report.page_count(), pages);

            let aggregated = aggregate(&texts, report.page_count()).await?;
            assert_eq!(aggregated.len(), pages);
            for (i, page) in aggregated.iter().enumerate() {
                assert_eq!(page.page_number, i + 1);
                assert_eq!(page.text, format!("page {}", i + 1));
                assert_eq!(page.error, None);
            }
        }
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn limiter_is_shared_across_dispatches() -> Result<()> {
        let limiter = Limiter::new("ocr", 3)?;
        let engine = Arc::new(FakeOcrEngine {
            delay: Some(|_| Duration::from_millis(5)),
            ..FakeOcrEngine::default()
        });
        let dispatcher = OcrDispatcher::new(engine.clone(), limiter.clone(), settings());

        let mut scratches = vec![];
        let mut handles = vec![];
        for _ in 0..4 {
            let (dir, images, texts) = scratch(10);
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                dispatcher.dispatch_all(&images, "jpg", &texts).await
            }));
            scratches.push(dir);
        }
        for handle in handles {
            assert_eq!(handle.await??.page_count(), 10);
        }
        assert!(engine.peak() <= 3, "peak was {}", engine.peak());
        assert_eq!(limiter.available(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn failures_are_isolated_and_permits_returned() -> Result<()> {
        let (_dir, images, texts) = scratch(5);
        let limiter = Limiter::new("ocr", 2)?;
        let engine = Arc::new(FakeOcrEngine {
            fail_pages: [2].into(),
            panic_pages: [3].into(),
            hang_pages: [4].into(),
            ..FakeOcrEngine::default()
        });
        let dispatcher = OcrDispatcher::new(
            engine,
            limiter.clone(),
            DispatchSettings {
                page_timeout: Duration::from_millis(100),
                ..settings()
            },
        );
        let report = dispatcher.dispatch_all(&images, "jpg", &texts).await?;

        assert_eq!(report.page_count(), 5);
        assert_eq!(report.failed_count(), 3);
        let errors = report
            .outcomes
            .iter()
            .map(|o| o.error.clone().unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(errors[0], "");
        assert!(errors[1].contains("failed on page 2"), "{}", errors[1]);
        assert!(errors[2].contains("panicked"), "{}", errors[2]);
        assert!(errors[3].contains("did not finish"), "{}", errors[3]);
        assert_eq!(errors[4], "");
        assert!(texts.join("p000002_error.txt").is_file());
        assert!(texts.join("p000005_text.txt").is_file());
        assert_eq!(limiter.available(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn dropping_the_dispatch_returns_permits() -> Result<()> {
        let (_dir, images, texts) = scratch(3);
        let limiter = Limiter::new("ocr", 2)?;
        let engine = Arc::new(FakeOcrEngine {
            hang_pages: [1, 2, 3].into(),
            ..FakeOcrEngine::default()
        });
        let dispatcher = OcrDispatcher::new(engine, limiter.clone(), settings());
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.dispatch_all(&images, "jpg", &texts),
        )
        .await;
        assert!(result.is_err());
        // Aborted tasks release their permits once the runtime drops them.
        for _ in 0..100 {
            if limiter.available() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(limiter.available(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn non_matching_entries_are_skipped() -> Result<()> {
        let (_dir, images, texts) = scratch(2);
        std::fs::write(images.join("p000003.png"), b"png")?;
        std::fs::write(images.join("README"), b"")?;
        std::fs::create_dir(images.join("nested.jpg"))?;
        let dispatcher = OcrDispatcher::new(
            Arc::new(FakeOcrEngine::default()),
            Limiter::new("ocr", 4)?,
            settings(),
        );
        let report = dispatcher.dispatch_all(&images, "jpg", &texts).await?;
        assert_eq!(report.page_count(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn gap_in_page_images_is_rejected_before_ocr() -> Result<()> {
        let (_dir, images, texts) = scratch(1);
        std::fs::write(images.join("p000003.jpg"), b"jpg")?;
        let dispatcher = OcrDispatcher::new(
            Arc::new(FakeOcrEngine::default()),
            Limiter::new("ocr", 4)?,
            settings(),
        );
        let err = dispatcher.dispatch_all(&images, "jpg", &texts).await.unwrap_err();
        assert!(err.to_string().contains("page 2"), "{err}");
        assert_eq!(std::fs::read_dir(&texts)?.count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn two_images_for_one_page_are_rejected_before_ocr() -> Result<()> {
        let (_dir, images, texts) = scratch(2);
        std::fs::write(images.join("p1.jpg"), b"jpg")?;
        let limiter = Limiter::new("ocr", 4)?;
        let dispatcher =
            OcrDispatcher::new(Arc::new(FakeOcrEngine::default()), limiter.clone(), settings());
        let err = dispatcher.dispatch_all(&images, "jpg", &texts).await.unwrap_err();
        assert!(err.to_string().contains("both page 1"), "{err}");
        assert_eq!(std::fs::read_dir(&texts)?.count(), 0);
        assert_eq!(limiter.available(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn empty_text_can_be_an_error() -> Result<()> {
        let (_dir, images, texts) = scratch(1);
        let engine = Arc::new(FakeOcrEngine::with_texts(&[(1, " \n ")]));
        let lenient = OcrDispatcher::new(engine.clone(), Limiter::new("ocr", 1)?, settings());
        assert_eq!(lenient.dispatch_all(&images, "jpg", &texts).await?.failed_count(), 0);

        let (_dir, images, texts) = scratch(1);
        let strict = OcrDispatcher::new(
            engine,
            Limiter::new("ocr", 1)?,
            DispatchSettings {
                empty_text_is_error: true,
                ..settings()
            },
        );
        assert_eq!(strict.dispatch_all(&images, "jpg", &texts).await?.failed_count(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn newlines_are_collapsed_unless_kept() -> Result<()> {
        let engine = Arc::new(FakeOcrEngine::with_texts(&[(1, "Hello\nWorld\n")]));
        for (collapse, expected) in [(true, "Hello World"), (false, "Hello\nWorld\n")] {
            let (_dir, images, texts) = scratch(1);
            let dispatcher = OcrDispatcher::new(
                engine.clone(),
                Limiter::new("ocr", 1)?,
                DispatchSettings {
                    collapse_newlines: collapse,
                    ..settings()
                },
            );
            dispatcher.dispatch_all(&images, "jpg", &texts).await?;
            assert_eq!(std::fs::read_to_string(texts.join("p000001_text.txt"))?, expected);
        }
        Ok(())
    }
}
