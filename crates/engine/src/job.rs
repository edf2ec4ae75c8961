//! Job descriptors and states

use crate::plan::Plan;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Stage of a job in the pipeline.
///
/// `Created → [Transcribing] → ResolvingCommand → Encoding → terminal`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Transcribing,
    ResolvingCommand,
    Encoding,
    Succeeded,
    Failed(String),
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Created => "created",
            JobState::Transcribing => "transcribing",
            JobState::ResolvingCommand => "resolving_command",
            JobState::Encoding => "encoding",
            JobState::Succeeded => "succeeded",
            JobState::Failed(_) => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed(_) | JobState::Cancelled
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Failed(reason) => write!(f, "failed: {}", reason),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Shared by every job built from the same source file in one pass.
///
/// The source may be deleted only once all of them have succeeded.
#[derive(Debug)]
pub struct SourceClaim {
    remaining: AtomicUsize,
    all_succeeded: AtomicBool,
}

impl SourceClaim {
    pub fn new(jobs: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(jobs),
            all_succeeded: AtomicBool::new(true),
        })
    }

    /// Record one job's result. Returns true for the last job of the group
    /// when every job in it succeeded.
    pub fn complete(&self, succeeded: bool) -> bool {
        if !succeeded {
            self.all_succeeded.store(false, Ordering::SeqCst);
        }
        let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
        before == 1 && self.all_succeeded.load(Ordering::SeqCst)
    }
}

/// One (source file, plan) pair
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub plan: Arc<Plan>,
    pub claim: Arc<SourceClaim>,
    /// May take a GPU permit; false pins the job to the CPU template
    pub gpu_eligible: bool,
    /// Set once transcription has written the caption file
    pub subtitle: Option<PathBuf>,
}

impl Job {
    pub fn new(
        source: PathBuf,
        destination: PathBuf,
        plan: Arc<Plan>,
        claim: Arc<SourceClaim>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source,
            destination,
            plan,
            claim,
            gpu_eligible: true,
            subtitle: None,
        }
    }

    pub fn with_gpu_eligible(mut self, eligible: bool) -> Self {
        self.gpu_eligible = eligible;
        self
    }

    /// Source file name without its extension
    pub fn file_stem(&self) -> String {
        self.source
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}
