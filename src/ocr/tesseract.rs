//! Tesseract OCR engine.

use tokio::process::Command;

use super::OcrEngine;
use crate::{async_utils::check_for_command_failure, prelude::*};

/// OCR engine wrapping the `tesseract` CLI tool.
#[derive(Clone, Debug)]
pub struct TesseractOcrEngine {
    /// The `tesseract` binary to run.
    program: PathBuf,
}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(level = "debug", skip_all, fields(image = %image.display(), language))]
    async fn recognize(&self, image: &Path, language: &str) -> Result<String> {
        // Write the text to stdout instead of a temporary file. If we're
        // cancelled, drop the child process along with us.
        let output = Command::new(&self.program)
            .arg(image)
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .kill_on_drop(true)
            .output()
            .await
            .context("cannot run tesseract")?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        check_for_command_failure("tesseract", output.status, &stderr)?;
        String::from_utf8(output.stdout).context("tesseract output was not valid UTF-8")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let engine = TesseractOcrEngine::new("definitely-not-tesseract-4f2a");
        assert!(engine.recognize(Path::new("p000001.jpg"), "eng").await.is_err());
    }

    #[tokio::test]
    #[ignore = "Requires tesseract to be installed"]
    async fn unreadable_image_is_an_error() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let image = dir.path().join("p000001.png");
        std::fs::write(&image, b"not an image")?;
        let engine = TesseractOcrEngine::new("tesseract");
        assert!(engine.recognize(&image, "eng").await.is_err());
        Ok(())
    }
}
