//! Subprocess execution with a timeout, cancellation and combined output.
//!
//! Every external program taskbridge runs (git, the code-generation tool,
//! the repository's test command) goes through [`run_captured`].  Stdout and
//! stderr are drained concurrently into one buffer, in arrival order, the
//! way a terminal would show them.  On timeout or cancellation the child is
//! killed; it is also killed if the future is dropped (`kill_on_drop`).

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};

/// Marker appended to output cut at a byte limit.
pub const TRUNCATED_MARKER: &str = "\n... (truncated)";

/// How a subprocess finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own.
    Exited(ExitStatus),
    /// The deadline fired and the process was killed.
    TimedOut(Duration),
    /// Shutdown was requested and the process was killed.
    Cancelled,
}

/// Combined output and outcome of one subprocess run.
#[derive(Debug, Clone)]
pub struct CapturedOutput {
    /// Interleaved stdout and stderr bytes.
    pub combined: Vec<u8>,
    pub outcome: ProcessOutcome,
}

impl CapturedOutput {
    /// Exited with status zero.
    pub fn success(&self) -> bool {
        matches!(self.outcome, ProcessOutcome::Exited(status) if status.success())
    }

    pub fn timed_out(&self) -> bool {
        matches!(self.outcome, ProcessOutcome::TimedOut(_))
    }

    /// Output decoded as (lossy) UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.combined).into_owned()
    }

    /// Human-readable failure reason, or `None` on success.
    pub fn failure(&self) -> Option<String> {
        match self.outcome {
            ProcessOutcome::Exited(status) if status.success() => None,
            ProcessOutcome::Exited(status) => Some(status.to_string()),
            ProcessOutcome::TimedOut(limit) => {
                Some(format!("timed out after {}s", limit.as_secs()))
            }
            ProcessOutcome::Cancelled => Some("cancelled".to_string()),
        }
    }
}

/// Run `program args..` in `cwd`, optionally feeding `stdin`, and capture
/// its combined output.
///
/// Returns `Err` only if the process could not be started or waited on; a
/// non-zero exit, a timeout and a cancellation are reported through
/// [`CapturedOutput::outcome`].
pub async fn run_captured(
    program: &str,
    args: &[&str],
    cwd: &Path,
    stdin: Option<&[u8]>,
    limit: Duration,
    cancel: &CancellationToken,
) -> Result<CapturedOutput> {
    let command_line = render_command(program, args);
    debug!(
        command = %command_line,
        cwd = %cwd.display(),
        timeout_secs = limit.as_secs(),
        "spawning process"
    );

    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| AdapterError::Spawn {
            command: command_line.clone(),
            source,
        })?;

    let input = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let combined = Mutex::new(Vec::new());

    let outcome = {
        let run = async {
            let (_, _, _, status) = tokio::join!(
                feed(input, stdin),
                pump(stdout, &combined),
                pump(stderr, &combined),
                child.wait(),
            );
            status
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => ProcessOutcome::Cancelled,
            waited = tokio::time::timeout(limit, run) => match waited {
                Ok(status) => ProcessOutcome::Exited(status?),
                Err(_) => ProcessOutcome::TimedOut(limit),
            },
        }
    };

    if !matches!(outcome, ProcessOutcome::Exited(_)) {
        warn!(command = %command_line, outcome = ?outcome, "killing process");
        if let Err(e) = child.kill().await {
            debug!(command = %command_line, error = %e, "kill after stop failed");
        }
    }

    let combined = combined.into_inner().unwrap_or_else(|p| p.into_inner());
    debug!(
        command = %command_line,
        outcome = ?outcome,
        output_bytes = combined.len(),
        "process finished"
    );
    Ok(CapturedOutput { combined, outcome })
}

/// Cut `raw` to `max` bytes (lossy UTF-8) and append [`TRUNCATED_MARKER`]
/// if anything was dropped.  `max == 0` disables the limit.
pub fn truncate_output(raw: &[u8], max: usize) -> String {
    if max == 0 || raw.len() <= max {
        return String::from_utf8_lossy(raw).into_owned();
    }
    let mut s = String::from_utf8_lossy(&raw[..max]).into_owned();
    s.push_str(TRUNCATED_MARKER);
    s
}

fn render_command(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Write `input` to the child's stdin, then close it so the child sees EOF.
async fn feed(pipe: Option<ChildStdin>, input: Option<&[u8]>) {
    if let (Some(mut pipe), Some(input)) = (pipe, input)
        && let Err(e) = pipe.write_all(input).await
    {
        debug!(error = %e, "child closed stdin before reading all input");
    }
}

async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, sink: &Mutex<Vec<u8>>) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => sink
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .extend_from_slice(&buf[..n]),
            Err(e) => {
                debug!(error = %e, "output pipe read failed");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
