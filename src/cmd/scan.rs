//! The `scan` subcommand.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use clap::Args;
use futures::{StreamExt as _, stream};
use tokio::fs;

use super::PipelineOpts;
use crate::{
    async_utils::io::write_output,
    pipeline::Pipeline,
    prelude::*,
    submission::{Submission, SubmissionStatus, Upload},
    ui::{ProgressConfig, Ui},
};

/// Scan command line arguments.
#[derive(Debug, Args)]
pub struct ScanOpts {
    /// PDFs and images to scan. Each file is a separate submission.
    #[clap(required = true, value_name = "FILE")]
    pub paths: Vec<PathBuf>,

    /// Output location, as JSONL. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    /// Max number of files to process at a time. OCR calls are still limited
    /// by `--ocr-jobs` across all of them.
    #[clap(short = 'j', long = "jobs", default_value = "2")]
    pub job_count: usize,

    /// What portion of files should we allow to fail? Specified as a number
    /// between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    #[clap(flatten)]
    pub pipeline: PipelineOpts,
}

/// One line of `scan` output.
#[derive(Debug, Serialize)]
struct ScanRecord {
    /// The input file.
    path: PathBuf,

    #[serde(flatten)]
    result: ScanResult,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum ScanResult {
    Scanned(Submission),
    Failed {
        status: SubmissionStatus,
        error: String,
    },
}

/// Running totals for a scan.
#[derive(Debug, Default)]
struct ScanCounters {
    total: AtomicUsize,
    failed: AtomicUsize,
    incomplete: AtomicUsize,
}

impl ScanCounters {
    fn update(&self, record: &ScanRecord) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match &record.result {
            ScanResult::Scanned(submission) if submission.status == SubmissionStatus::Ok => {}
            ScanResult::Scanned(_) => {
                self.incomplete.fetch_add(1, Ordering::Relaxed);
            }
            ScanResult::Failed { .. } => {
                self.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Report totals, and fail if too many files could not be processed.
    fn finish(&self, ui: &Ui, allowed_failure_rate: f32) -> Result<()> {
        let total = self.total.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let incomplete = self.incomplete.load(Ordering::Relaxed);
        if total == 0 {
            return Ok(());
        }
        let failure_rate = failed as f32 / total as f32;
        if failure_rate > allowed_failure_rate {
            return Err(anyhow!(
                "{}/{} ({:.2}%) of files could not be scanned, but only {:.2}% were allowed",
                failed,
                total,
                failure_rate * 100.0,
                allowed_failure_rate * 100.0
            ));
        }
        if incomplete > 0 {
            ui.display_message(
                "⚠️",
                &format!("{} files had pages that could not be OCRed", incomplete),
            );
        }
        if failed > 0 {
            ui.display_message("❌", &format!("{} files could not be scanned", failed));
        }
        Ok(())
    }
}

/// The `scan` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_scan(ui: Ui, opts: &ScanOpts) -> Result<()> {
    if opts.job_count == 0 {
        return Err(anyhow!("--jobs must be at least 1"));
    }
    if !(0.0..=1.0).contains(&opts.allowed_failure_rate) {
        return Err(anyhow!("--allowed-failure-rate must be between 0.0 and 1.0"));
    }
    let pipeline = Arc::new(opts.pipeline.build()?);

    let pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "Scanning files",
            done_msg: "Scanned files",
        },
        opts.paths.len() as u64,
    );
    let records = stream::iter(opts.paths.clone())
        .map(move |path| scan_file(pipeline.clone(), path))
        .buffered(opts.job_count);

    let counters = Arc::new(ScanCounters::default());
    let counters_clone = counters.clone();
    let output = pb
        .wrap_stream(records)
        .map(move |record| {
            counters_clone.update(&record);
            serde_json::to_value(&record).context("failed to serialize scan record")
        })
        .boxed();
    write_output(opts.output_path.as_deref(), output).await?;
    counters.finish(&ui, opts.allowed_failure_rate)
}

/// Scan one file, turning any fatal error into a failure record.
#[instrument(level = "debug", skip(pipeline))]
async fn scan_file(pipeline: Arc<Pipeline>, path: PathBuf) -> ScanRecord {
    let result: Result<Submission> = async {
        let data = fs::read(&path)
            .await
            .with_context(|| format!("cannot read {:?}", path.display()))?;
        let upload = Upload {
            file_name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            data,
        };
        let (kind, _) = upload.detect()?;
        Ok(pipeline.process(upload, kind).await?)
    }
    .await;

    let result = match result {
        Ok(submission) => ScanResult::Scanned(submission),
        Err(err) => {
            error!(path = %path.display(), "Cannot scan file: {:#}", err);
            ScanResult::Failed {
                status: SubmissionStatus::Failed,
                error: format!("{:#}", err),
            }
        }
    };
    ScanRecord { path, result }
}
