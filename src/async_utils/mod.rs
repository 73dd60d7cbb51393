//! Asynchronous utilities for use with Tokio.
//!
//! Mostly helpers for running external tools without blocking the executor,
//! and without letting a chatty tool fill up a pipe and stall.

use std::{collections::VecDeque, pin::Pin, process::ExitStatus, sync::LazyLock};

use futures::{Stream, StreamExt as _};
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, BufReader},
    process::Command,
    task::JoinHandle,
};
use tokio_stream::wrappers::LinesStream;

use crate::prelude::*;

pub mod io;

/// A boxed, sendable stream.
pub type BoxedStream<Item> = Pin<Box<dyn Stream<Item = Item> + Send>>;

/// How many trailing lines of standard error we keep for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// What a command left behind once it exited.
#[derive(Debug)]
pub struct StreamedOutput {
    /// How the command exited.
    pub status: ExitStatus,
    /// How many lines it wrote to standard output.
    pub stdout_line_count: usize,
    /// The last few lines it wrote to standard error.
    pub stderr_tail: Vec<String>,
}

impl StreamedOutput {
    /// Standard error tail as a single string.
    pub fn stderr(&self) -> String {
        self.stderr_tail.join("\n")
    }
}

/// Run a command, logging its output line by line as it arrives.
///
/// Both pipes are drained on background tasks for as long as the command
/// runs, so a command that writes a lot can never block on a full pipe.
/// The child is killed if this future is dropped.
#[instrument(level = "debug", skip_all, fields(command = command_name))]
pub async fn run_streaming(command_name: &str, cmd: &mut Command) -> Result<StreamedOutput> {
    let mut child = cmd
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to start {}", command_name))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("{} has no stdout pipe", command_name))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("{} has no stderr pipe", command_name))?;

    let stdout_task = drain_lines(command_name.to_owned(), stdout, false);
    let stderr_task = drain_lines(command_name.to_owned(), stderr, true);

    let status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for {}", command_name))?;

    let (stdout_line_count, _) = stdout_task
        .await
        .with_context(|| format!("could not join {} stdout reader", command_name))??;
    let (_, stderr_tail) = stderr_task
        .await
        .with_context(|| format!("could not join {} stderr reader", command_name))??;

    Ok(StreamedOutput {
        status,
        stdout_line_count,
        stderr_tail: stderr_tail.into(),
    })
}

/// Read lines from a pipe until it closes, logging each one. Returns the
/// number of lines seen and the last few of them.
fn drain_lines<R>(
    command_name: String,
    pipe: R,
    is_stderr: bool,
) -> JoinHandle<Result<(usize, VecDeque<String>)>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LinesStream::new(BufReader::new(pipe).lines());
        let mut count = 0;
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        while let Some(line) = lines.next().await {
            let line = line.with_context(|| format!("failed to read {} output", command_name))?;
            count += 1;
            if is_stderr {
                if DEFAULT_ERROR_REGEX.is_match(&line) {
                    warn!(command_name = %command_name, "{}", line);
                } else {
                    debug!(command_name = %command_name, "{}", line);
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            } else {
                debug!(command_name = %command_name, "output | {}", line);
            }
        }
        Ok((count, tail))
    })
}

/// Report any command failures, and include any error output.
pub fn check_for_command_failure(
    command_name: &str,
    status: ExitStatus,
    stderr: &str,
) -> Result<()> {
    if status.success() {
        Ok(())
    } else if let Some(exit_code) = status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(unix)]
    async fn drains_large_output_without_blocking() -> Result<()> {
        // Far more than a pipe buffer holds.
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; echo oops error >&2");
        let output = run_streaming("sh", &mut cmd).await?;
        assert!(output.status.success());
        assert_eq!(output.stdout_line_count, 20000);
        assert_eq!(output.stderr_tail, vec!["oops error".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn reports_exit_codes() -> Result<()> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo bad input >&2; exit 3");
        let output = run_streaming("sh", &mut cmd).await?;
        let err = check_for_command_failure("sh", output.status, &output.stderr())
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"), "{msg}");
        assert!(msg.contains("bad input"), "{msg}");
        Ok(())
    }

    #[tokio::test]
    async fn missing_commands_fail_to_start() {
        let mut cmd = Command::new("definitely-not-a-real-command-4f2a");
        assert!(run_streaming("missing", &mut cmd).await.is_err());
    }
}
