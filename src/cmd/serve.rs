//! The `serve` subcommand.

use std::{net::SocketAddr, sync::Arc};

use clap::Args;

use super::PipelineOpts;
use crate::{prelude::*, server};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, env = "LISTEN", default_value = "127.0.0.1:8080")]
    pub listen: SocketAddr,

    /// Largest accepted upload, in megabytes.
    #[clap(long = "max-upload-mb", env = "MAX_UPLOAD_MB", default_value = "32")]
    pub max_upload_mb: usize,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    if opts.max_upload_mb == 0 {
        return Err(anyhow!("--max-upload-mb must be at least 1"));
    }
    let pipeline = Arc::new(opts.pipeline.build()?);
    let max_upload_bytes = opts.max_upload_mb.saturating_mul(1024 * 1024);
    server::serve(opts.listen, pipeline, max_upload_bytes).await
}
