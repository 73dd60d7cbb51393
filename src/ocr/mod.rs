//! OCR engine interface.

use crate::prelude::*;

pub mod tesseract;

/// Interface to an OCR engine.
///
/// From the pipeline's point of view this is opaque and possibly slow. An
/// engine may fail by returning an error, by panicking, or by hanging; the
/// dispatcher guards against all three.
#[async_trait]
pub trait OcrEngine: Send + Sync + 'static {
    /// Extract the text from a single page image.
    async fn recognize(&self, image: &Path, language: &str) -> Result<String>;
}

/// Join the non-empty lines of `text` with single spaces.
///
/// Trailing whitespace on each line is dropped, and blank lines disappear
/// entirely, so Tesseract's paragraph breaks don't turn into runs of spaces.
/// Leading indentation is kept.
pub fn collapse_newlines(text: &str) -> String {
    text.lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
pub(crate) mod fakes {
    use std::{
        collections::{HashMap, HashSet},
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;
    use crate::page_key::PageKey;

    /// A scriptable OCR engine for tests. Page `n` yields `page n` unless
    /// told otherwise, and tracks how many calls run at once.
    #[derive(Default)]
    pub(crate) struct FakeOcrEngine {
        pub texts: HashMap<usize, String>,
        pub fail_pages: HashSet<usize>,
        pub panic_pages: HashSet<usize>,
        pub hang_pages: HashSet<usize>,
        /// Per-page delay, to shuffle completion order.
        pub delay: Option<fn(usize) -> Duration>,
        pub running: AtomicUsize,
        pub peak: AtomicUsize,
        pub calls: AtomicUsize,
    }

    impl FakeOcrEngine {
        pub(crate) fn with_texts(texts: &[(usize, &str)]) -> Self {
            Self {
                texts: texts.iter().map(|(n, t)| (*n, (*t).to_owned())).collect(),
                ..Self::default()
            }
        }

        pub(crate) fn peak(&self) -> usize {
            self.peak.load(Ordering::SeqCst)
        }
    }

    /// Decrements the running count even if the call panics or is dropped.
    struct Running<'a>(&'a AtomicUsize);

    impl Drop for Running<'_> {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl OcrEngine for FakeOcrEngine {
        async fn recognize(&self, image: &Path, _language: &str) -> Result<String> {
            let page = PageKey::from_image_path(image)
                .ok_or_else(|| anyhow!("not a page image: {:?}", image))?
                .page_number();
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            let _running = Running(&self.running);
            self.peak.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay(page)).await;
            } else {
                tokio::task::yield_now().await;
            }
            if self.hang_pages.contains(&page) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.panic_pages.contains(&page) {
                panic!("fake engine panicked on page {page}");
            }
            if self.fail_pages.contains(&page) {
                return Err(anyhow!("fake engine failed on page {}", page));
            }
            Ok(self
                .texts
                .get(&page)
                .cloned()
                .unwrap_or_else(|| format!("page {page}")))
        }
    }
}
