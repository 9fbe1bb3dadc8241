//! Subprocess execution with live progress parsing and cancellation.
//!
//! The executor spawns the planned argv in its own process group, reads
//! stdout and stderr concurrently (progress lines from both encoders arrive
//! carriage-return-separated, so splitting happens on `\r` and `\n`), feeds
//! parsed percentages to the caller, and keeps the last 8 KiB of stderr for
//! the failure report. Cancellation sends the group a termination signal and
//! escalates to a kill after a grace period.

use crate::planner::ProgressFormat;
use regex::Regex;
use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Bytes of stderr retained for the job's error field.
const STDERR_TAIL_BYTES: usize = 8 * 1024;

/// How long a cancelled child gets to exit before the forceful kill.
const CANCEL_GRACE: Duration = Duration::from_secs(10);

/// Error type for executor operations.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {0}: {1}")]
    Spawn(String, std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a finished (or cancelled) subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The child exited on its own.
    Exited {
        success: bool,
        exit_code: Option<i32>,
        stderr_tail: String,
    },
    /// Cancellation was requested and the child was terminated.
    Cancelled { stderr_tail: String },
}

/// Parses encoder progress lines into percentages.
#[derive(Debug, Clone)]
pub struct ProgressParser {
    format: ProgressFormat,
    ffmpeg_time: Regex,
    handbrake_percent: Regex,
}

impl ProgressParser {
    pub fn new(format: ProgressFormat) -> Self {
        Self {
            format,
            ffmpeg_time: Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").expect("static regex"),
            handbrake_percent: Regex::new(r"Encoding: task \d+ of \d+, (\d+(?:\.\d+)?)\s*%")
                .expect("static regex"),
        }
    }

    /// Extracts a progress percentage from one output line, if present.
    pub fn parse_line(&self, line: &str) -> Option<f64> {
        match self.format {
            ProgressFormat::FfmpegTime { duration_secs } => {
                if duration_secs <= 0.0 {
                    return None;
                }
                let caps = self.ffmpeg_time.captures(line)?;
                let hours: f64 = caps[1].parse().ok()?;
                let mins: f64 = caps[2].parse().ok()?;
                let secs: f64 = caps[3].parse().ok()?;
                let position = hours * 3600.0 + mins * 60.0 + secs;
                Some((position / duration_secs * 100.0).min(100.0))
            }
            ProgressFormat::HandbrakePercent => {
                let caps = self.handbrake_percent.captures(line)?;
                caps[1].parse().ok()
            }
        }
    }
}

/// Splits a byte stream into lines on both `\n` and `\r`.
///
/// Encoders rewrite their status line with bare carriage returns; a
/// newline-only reader would see one giant line at exit.
#[derive(Debug, Default)]
struct LineAccumulator {
    partial: Vec<u8>,
}

impl LineAccumulator {
    fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &b in bytes {
            if b == b'\n' || b == b'\r' {
                if !self.partial.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.partial).to_string());
                    self.partial.clear();
                }
            } else {
                self.partial.push(b);
            }
        }
        lines
    }

    fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            let line = String::from_utf8_lossy(&self.partial).to_string();
            self.partial.clear();
            Some(line)
        }
    }
}

async fn read_stream<R: tokio::io::AsyncRead + Unpin>(
    mut reader: R,
    parser: ProgressParser,
    tx: mpsc::UnboundedSender<f64>,
    keep_tail: bool,
) -> Vec<u8> {
    let mut acc = LineAccumulator::default();
    let mut tail: VecDeque<u8> = VecDeque::new();
    let mut buf = [0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if keep_tail {
                    for &b in &buf[..n] {
                        if tail.len() == STDERR_TAIL_BYTES {
                            tail.pop_front();
                        }
                        tail.push_back(b);
                    }
                }
                for line in acc.feed(&buf[..n]) {
                    if let Some(p) = parser.parse_line(&line) {
                        let _ = tx.send(p);
                    }
                }
            }
        }
    }

    if let Some(line) = acc.flush() {
        if let Some(p) = parser.parse_line(&line) {
            let _ = tx.send(p);
        }
    }

    tail.into_iter().collect()
}

/// Sends a signal to the child's whole process group.
#[cfg(unix)]
fn signal_group(child: &Child, signal: i32) {
    if let Some(pid) = child.id() {
        // The child was spawned as a group leader, so -pid addresses the group
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_child: &Child, _signal: i32) {}

/// Waits for the child to exit while forwarding parsed progress.
async fn drain_until_exit(
    child: &mut Child,
    rx: &mut mpsc::UnboundedReceiver<f64>,
    on_progress: &(dyn Fn(f64) + Send + Sync),
) -> Result<std::process::ExitStatus, std::io::Error> {
    let mut rx_open = true;
    loop {
        tokio::select! {
            status = child.wait() => return status,
            maybe = rx.recv(), if rx_open => {
                match maybe {
                    Some(p) => on_progress(p),
                    None => rx_open = false,
                }
            }
        }
    }
}

/// Runs the argv to completion.
///
/// `on_progress` receives percentages as the child reports them; throttling
/// is the caller's concern. On cancellation the group gets a graceful
/// termination signal, then a kill after ten seconds.
pub async fn run(
    argv: &[String],
    on_progress: &(dyn Fn(f64) + Send + Sync),
    format: ProgressFormat,
    cancel: &CancellationToken,
) -> Result<ExecOutcome, ExecError> {
    let (program, args) = argv.split_first().ok_or(ExecError::EmptyCommand)?;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|e| ExecError::Spawn(program.clone(), e))?;

    let parser = ProgressParser::new(format);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");
    let stdout_task = tokio::spawn(read_stream(stdout, parser.clone(), tx.clone(), false));
    let stderr_task = tokio::spawn(read_stream(stderr, parser, tx, true));

    let mut cancelled = false;
    let status = tokio::select! {
        status = drain_until_exit(&mut child, &mut rx, on_progress) => status?,
        _ = cancel.cancelled() => {
            cancelled = true;
            signal_group(&child, libc_sigterm());
            match tokio::time::timeout(
                CANCEL_GRACE,
                drain_until_exit(&mut child, &mut rx, on_progress),
            )
            .await
            {
                Ok(status) => status?,
                Err(_) => {
                    signal_group(&child, libc_sigkill());
                    let _ = child.start_kill();
                    drain_until_exit(&mut child, &mut rx, on_progress).await?
                }
            }
        }
    };

    let _ = stdout_task.await;
    let stderr_tail_bytes = stderr_task.await.unwrap_or_default();
    let stderr_tail = String::from_utf8_lossy(&stderr_tail_bytes).to_string();

    if cancelled {
        Ok(ExecOutcome::Cancelled { stderr_tail })
    } else {
        Ok(ExecOutcome::Exited {
            success: status.success(),
            exit_code: status.code(),
            stderr_tail,
        })
    }
}

#[cfg(unix)]
fn libc_sigterm() -> i32 {
    libc::SIGTERM
}

#[cfg(unix)]
fn libc_sigkill() -> i32 {
    libc::SIGKILL
}

#[cfg(not(unix))]
fn libc_sigterm() -> i32 {
    0
}

#[cfg(not(unix))]
fn libc_sigkill() -> i32 {
    0
}
