//! Job executor
//!
//! Carries one job through its stages on a worker: optional transcription,
//! command resolution, then the supervised encode. Every exit path returns the
//! GPU permit, removes temporary audio and subtitle files, and records exactly
//! one terminal outcome.

use crate::arbiter::{GpuPermit, ResourceArbiter};
use crate::job::{Job, JobState};
use crate::plan::ResolveError;
use crate::session::{Outcome, Session};
use crate::status::{JobStatus, SharedStatus};
use crate::supervisor::{EncodeError, EncodeReport, EncodeSupervisor};
use crate::template::{substitute, Substitutions, TemplateRequest, TemplateSource};
use crate::transcribe::{TranscribeError, Transcriber};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for job execution
#[derive(Debug, Error)]
pub enum JobError {
    /// Subtitle generation failed
    #[error("Transcription failed: {0}")]
    Transcription(#[from] TranscribeError),

    /// Plan or command template could not be resolved
    #[error("Command resolution failed: {0}")]
    Resolve(#[from] ResolveError),

    /// The destination directory could not be created
    #[error("Failed to create output directory {dir}: {source}")]
    OutputDir {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The encoder failed or produced no usable output
    #[error("Encode failed: {0}")]
    Encode(#[from] EncodeError),
}

impl JobError {
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            JobError::Transcription(TranscribeError::Cancelled)
                | JobError::Encode(EncodeError::Cancelled)
        )
    }

    /// Encoder error lines captured before the failure
    pub fn encoder_errors(&self) -> &[String] {
        match self {
            JobError::Encode(e) => e.error_lines(),
            _ => &[],
        }
    }
}

/// Run-wide settings that shape every job
#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub more_effects: bool,
    pub canvas_y: f32,
    pub delete_source: bool,
}

/// Terminal result of one job
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub id: String,
    pub source: PathBuf,
    pub state: JobState,
    pub used_gpu: bool,
    pub report: Option<EncodeReport>,
    /// Encoder error lines, from a failed encode or a successful one that
    /// still reported errors
    pub errors: Vec<String>,
}

/// Temporary files owned by one job, removed when the job ends however it ends.
#[derive(Debug, Default)]
struct TempArtifacts {
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        for path in self.paths.drain(..) {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
            }
        }
    }
}

/// Executes jobs against shared run resources
pub struct JobExecutor {
    arbiter: ResourceArbiter,
    templates: Arc<dyn TemplateSource>,
    transcriber: Arc<dyn Transcriber>,
    supervisor: EncodeSupervisor,
    session: Arc<Session>,
    status: SharedStatus,
    settings: ExecutionSettings,
}

impl JobExecutor {
    pub fn new(
        arbiter: ResourceArbiter,
        templates: Arc<dyn TemplateSource>,
        transcriber: Arc<dyn Transcriber>,
        supervisor: EncodeSupervisor,
        session: Arc<Session>,
        status: SharedStatus,
        settings: ExecutionSettings,
    ) -> Self {
        Self {
            arbiter,
            templates,
            transcriber,
            supervisor,
            session,
            status,
            settings,
        }
    }

    /// Execute a job through every stage and record its terminal state.
    ///
    /// Never returns an error: failures are isolated to the job and reported
    /// through the outcome, the session counters and the status board.
    pub async fn execute(&self, mut job: Job, cancel: &CancellationToken) -> JobOutcome {
        self.publish(&job, &JobState::Created, false, None).await;

        let mut temp = TempArtifacts::default();
        let mut gpu: Option<GpuPermit> = None;
        let result = self.run_stages(&mut job, cancel, &mut temp, &mut gpu).await;
        let used_gpu = gpu.is_some();

        let (state, report, errors) = match result {
            Ok(report) => {
                let errors = report.errors.clone();
                (JobState::Succeeded, Some(report), errors)
            }
            Err(e) if e.is_cancellation() => (JobState::Cancelled, None, Vec::new()),
            Err(e) => (
                JobState::Failed(e.to_string()),
                None,
                e.encoder_errors().to_vec(),
            ),
        };

        // Release the slot before the (possibly slow) source deletion.
        drop(gpu);
        drop(temp);

        let source_done = job.claim.complete(state == JobState::Succeeded);
        if source_done && self.settings.delete_source {
            self.delete_source(&job.source).await;
        }

        match &state {
            JobState::Succeeded => {
                info!(job = %job.id, source = %job.source.display(), destination = %job.destination.display(), plan = job.plan.id, gpu = used_gpu, "Job succeeded");
                self.session.record(Outcome::Succeeded);
            }
            JobState::Cancelled => {
                info!(job = %job.id, source = %job.source.display(), "Job cancelled");
                self.session.record(Outcome::Cancelled);
            }
            JobState::Failed(reason) => {
                error!(job = %job.id, source = %job.source.display(), plan = job.plan.id, reason = %reason, "Job failed");
                self.session.record(Outcome::Failed);
            }
            _ => {}
        }

        // The board shows the last captured encoder line rather than the whole list.
        let detail = match &state {
            JobState::Failed(reason) => Some(errors.last().cloned().unwrap_or_else(|| reason.clone())),
            _ => None,
        };
        let mut entry = self.job_status(&job, &state, used_gpu, detail);
        entry.last_progress = report.as_ref().and_then(|r| r.last_progress.clone());
        self.post(entry, &state).await;

        JobOutcome {
            id: job.id,
            source: job.source,
            state,
            used_gpu,
            report,
            errors,
        }
    }

    async fn run_stages(
        &self,
        job: &mut Job,
        cancel: &CancellationToken,
        temp: &mut TempArtifacts,
        gpu: &mut Option<GpuPermit>,
    ) -> Result<EncodeReport, JobError> {
        // Subtitle plans fail outright when transcription fails; there is no
        // fallback to an unsubtitled encode.
        if job.plan.add_subtitle {
            self.publish(job, &JobState::Transcribing, false, None).await;
            let transcript = self.transcriber.transcribe(&job.source, cancel).await?;
            temp.track(transcript.audio_path);
            temp.track(transcript.subtitle_path.clone());
            job.subtitle = Some(transcript.subtitle_path);
        }

        if job.gpu_eligible {
            *gpu = self.arbiter.try_acquire_gpu();
        }
        let use_gpu = gpu.is_some();
        self.publish(job, &JobState::ResolvingCommand, use_gpu, None).await;

        let request = TemplateRequest {
            plan: &job.plan,
            more_effects: self.settings.more_effects,
            canvas_y: self.settings.canvas_y,
        };
        let templates = self.templates.command_templates(&request).await?;
        let template = templates.select(use_gpu, job.plan.id)?;

        let input = job.source.to_string_lossy();
        let output = job.destination.to_string_lossy();
        let subtitle_str = job.subtitle.as_ref().map(|p| p.to_string_lossy());
        let filename = job.file_stem();
        let command = substitute(
            template,
            &Substitutions {
                input_file: &input,
                output_file: &output,
                subtitle_file: subtitle_str.as_deref(),
                filename: &filename,
            },
        );

        if let Some(dir) = job.destination.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| JobError::OutputDir {
                    dir: dir.to_path_buf(),
                    source,
                })?;
        }

        self.publish(job, &JobState::Encoding, use_gpu, None).await;
        info!(job = %job.id, source = %job.source.display(), plan = job.plan.id, gpu = use_gpu, "Encoding");

        let status = self.status.clone();
        let id = job.id.clone();
        let report = self
            .supervisor
            .run(&command, &job.destination, cancel, move |timestamp| {
                // Progress is best effort; skip the update if the board is busy.
                if let Ok(mut snapshot) = status.try_write() {
                    snapshot.set_progress(&id, timestamp);
                }
            })
            .await?;

        for line in &report.errors {
            warn!(job = %job.id, line = %line, "Encoder reported an error but finished");
        }
        Ok(report)
    }

    async fn delete_source(&self, source: &Path) {
        match tokio::fs::remove_file(source).await {
            Ok(()) => info!(source = %source.display(), "Deleted source"),
            Err(e) => warn!(source = %source.display(), error = %e, "Failed to delete source"),
        }
    }

    fn job_status(
        &self,
        job: &Job,
        state: &JobState,
        gpu: bool,
        detail: Option<String>,
    ) -> JobStatus {
        JobStatus {
            id: job.id.clone(),
            source: job.source.to_string_lossy().to_string(),
            destination: job.destination.to_string_lossy().to_string(),
            plan_id: job.plan.id,
            stage: state.as_str().to_string(),
            gpu,
            last_progress: None,
            detail,
        }
    }

    async fn publish(&self, job: &Job, state: &JobState, gpu: bool, detail: Option<String>) {
        debug!(job = %job.id, stage = state.as_str(), "Stage");
        let entry = self.job_status(job, state, gpu, detail);
        self.post(entry, state).await;
    }

    /// Terminal states move the entry to the recent list.
    async fn post(&self, entry: JobStatus, state: &JobState) {
        let mut status = self.status.write().await;
        if state.is_terminal() {
            status.finish_job(entry);
            status.session = self.session.report();
        } else {
            status.upsert_job(entry);
        }
        status.gpu_in_use = self.arbiter.gpu_in_use();
        status.workers_busy = self.arbiter.workers_in_use();
    }
}
