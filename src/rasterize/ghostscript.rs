//! Rasterizer wrapping the Ghostscript `gs` CLI tool.

use tokio::process::Command;

use super::{RasterizeRequest, Rasterizer};
use crate::{
    async_utils::{check_for_command_failure, run_streaming},
    page_key::PageKey,
    prelude::*,
};

/// Ghostscript output device, and the matching file extension.
const DEVICE: &str = "jpeg";
const EXTENSION: &str = "jpg";

/// Renders PDF pages to JPEG files with `gs`.
#[derive(Clone, Debug)]
pub struct GhostscriptRasterizer {
    /// The `gs` binary to run.
    program: PathBuf,
    /// Output resolution.
    dpi: u32,
}

impl GhostscriptRasterizer {
    /// Create a new Ghostscript rasterizer.
    pub fn new(program: impl Into<PathBuf>, dpi: u32) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }

    /// Build the command line for a request.
    ///
    /// The output pattern is always an absolute path inside the request's
    /// output directory; we never rely on the process working directory.
    fn command(&self, request: &RasterizeRequest<'_>) -> Command {
        let pattern = request
            .output_dir
            .join(PageKey::ghostscript_pattern(EXTENSION));
        let mut cmd = Command::new(&self.program);
        cmd.arg("-q")
            .arg("-dNOPAUSE")
            .arg("-dBATCH")
            .arg("-dSAFER")
            .arg(format!("-sDEVICE={}", DEVICE))
            .arg(format!("-r{}", self.dpi))
            .arg(format!("-dLastPage={}", request.last_page))
            .arg(format!("-sOutputFile={}", pattern.display()))
            // Everything after `--` is a file name, even if it starts with `-`.
            .arg("--")
            .arg(request.source);
        cmd
    }
}

#[async_trait]
impl Rasterizer for GhostscriptRasterizer {
    fn image_extension(&self) -> &'static str {
        EXTENSION
    }

    #[instrument(level = "debug", skip_all, fields(source = %request.source.display(), dpi = self.dpi))]
    async fn rasterize(&self, request: &RasterizeRequest<'_>) -> Result<()> {
        if !request.output_dir.is_absolute() {
            return Err(anyhow!(
                "rasterizer output directory {:?} must be absolute",
                request.output_dir.display()
            ));
        }
        info!("Extracting page images with Ghostscript");
        let mut cmd = self.command(request);
        let output = run_streaming("gs", &mut cmd)
            .await
            .with_context(|| format!("failed to run gs on {:?}", request.source.display()))?;
        check_for_command_failure("gs", output.status, &output.stderr())?;
        debug!(lines = output.stdout_line_count, "Ghostscript finished");
        Ok(())
    }
}
