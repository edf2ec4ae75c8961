//! Encode process supervision
//!
//! Runs one resolved encoder command line through the platform shell, streams
//! its diagnostic output and decides the outcome. A zero exit status alone is
//! not success: the destination must also exist and be non-empty.

use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error lines kept for the failure report; later ones are counted only.
pub const MAX_CAPTURED_ERRORS: usize = 50;

/// Error type for a supervised encode
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The encoder exited unsuccessfully
    #[error("Encoder exited with {}: {}", exit_label(*code), summarize(errors))]
    Failed { code: Option<i32>, errors: Vec<String> },

    /// Exit status 0 but no destination file
    #[error("Encoder produced no output file: {}", summarize(errors))]
    MissingOutput { errors: Vec<String> },

    /// Exit status 0 but a zero-byte destination file
    #[error("Encoder produced an empty output file: {}", summarize(errors))]
    EmptyOutput { errors: Vec<String> },

    /// Terminated by the run's cancellation token
    #[error("Encode cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    /// Captured diagnostic lines, if any
    pub fn error_lines(&self) -> &[String] {
        match self {
            EncodeError::Failed { errors, .. }
            | EncodeError::MissingOutput { errors }
            | EncodeError::EmptyOutput { errors } => errors,
            EncodeError::Cancelled | EncodeError::Io(_) => &[],
        }
    }
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "a signal".to_string(),
    }
}

fn summarize(errors: &[String]) -> String {
    if errors.is_empty() {
        "no error output".to_string()
    } else {
        errors.join("; ")
    }
}

/// How one diagnostic line is treated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineKind {
    /// Carries an elapsed media timestamp, e.g. `00:01:02.50`
    Progress(String),
    /// Carries an error marker
    Error,
    Ignored,
}

/// Classifies encoder diagnostic lines
#[derive(Debug, Clone)]
pub struct LineClassifier {
    progress: Regex,
    error: Regex,
}

impl LineClassifier {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            progress: Regex::new(r"time=(\d{2}:\d{2}:\d{2}\.\d{2})")?,
            error: Regex::new(r"(?i)\berror\b|错误")?,
        })
    }

    /// Progress wins when a line matches both patterns.
    pub fn classify(&self, line: &str) -> LineKind {
        if let Some(caps) = self.progress.captures(line) {
            return LineKind::Progress(caps[1].to_string());
        }
        if self.error.is_match(line) {
            return LineKind::Error;
        }
        LineKind::Ignored
    }
}

/// What a successful encode left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodeReport {
    pub output_bytes: u64,
    pub last_progress: Option<String>,
    /// Error-marked lines seen even though the encode succeeded
    pub errors: Vec<String>,
}

/// Spawns and watches encoder processes
#[derive(Debug, Clone)]
pub struct EncodeSupervisor {
    classifier: LineClassifier,
}

impl EncodeSupervisor {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            classifier: LineClassifier::new()?,
        })
    }

    /// Run `command` to completion, reporting progress timestamps as they arrive.
    ///
    /// The cancellation token is checked on every diagnostic line and while
    /// waiting for exit; on cancellation the child is killed and the partial
    /// destination is left as is.
    pub async fn run<F>(
        &self,
        command: &str,
        destination: &Path,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<EncodeReport, EncodeError>
    where
        F: FnMut(&str) + Send,
    {
        if cancel.is_cancelled() {
            return Err(EncodeError::Cancelled);
        }

        debug!(command, "Spawning encoder");
        let mut child = shell_command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut errors = Vec::new();
        let mut dropped_errors = 0usize;
        let mut last_progress = None;

        if let Some(stderr) = child.stderr.take() {
            // The encoder rewrites its progress line with '\r'; split on it as well as '\n'.
            let mut segments = BufReader::new(stderr).split(b'\r');
            loop {
                let segment = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(terminate(&mut child).await),
                    segment = segments.next_segment() => segment?,
                };
                let Some(segment) = segment else { break };

                let text = String::from_utf8_lossy(&segment);
                for line in text.split('\n').map(str::trim).filter(|l| !l.is_empty()) {
                    match self.classifier.classify(line) {
                        LineKind::Progress(timestamp) => {
                            on_progress(&timestamp);
                            last_progress = Some(timestamp);
                        }
                        LineKind::Error => {
                            if errors.len() < MAX_CAPTURED_ERRORS {
                                errors.push(line.to_string());
                            } else {
                                dropped_errors += 1;
                            }
                        }
                        LineKind::Ignored => {}
                    }
                }
            }
        }

        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status?),
        };
        let Some(status) = exited else {
            return Err(terminate(&mut child).await);
        };

        if dropped_errors > 0 {
            warn!(dropped = dropped_errors, "Encoder error output truncated");
        }

        if !status.success() {
            return Err(EncodeError::Failed {
                code: status.code(),
                errors,
            });
        }

        match tokio::fs::metadata(destination).await {
            Ok(meta) if meta.len() > 0 => Ok(EncodeReport {
                output_bytes: meta.len(),
                last_progress,
                errors,
            }),
            Ok(_) => Err(EncodeError::EmptyOutput { errors }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(EncodeError::MissingOutput { errors })
            }
            Err(e) => Err(EncodeError::Io(e)),
        }
    }
}

async fn terminate(child: &mut Child) -> EncodeError {
    info!(pid = child.id(), "Cancellation requested, killing encoder");
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill encoder process");
    }
    EncodeError::Cancelled
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
