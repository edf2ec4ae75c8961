//! Test doubles shared by the executor and orchestrator tests

use crate::plan::{builtin_plans, Plan, ResolveError};
use crate::template::{CommandTemplate, TemplateRequest, TemplateSource};
use crate::transcribe::{TranscribeError, Transcriber, TranscriptOutput};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Templates that run plain shell commands
pub struct ShellTemplates {
    pub gpu: String,
    pub cpu: String,
}

impl ShellTemplates {
    pub fn same(command: &str) -> Arc<Self> {
        Arc::new(Self {
            gpu: command.to_string(),
            cpu: command.to_string(),
        })
    }
}

#[async_trait]
impl TemplateSource for ShellTemplates {
    async fn command_templates(
        &self,
        _request: &TemplateRequest<'_>,
    ) -> Result<CommandTemplate, ResolveError> {
        Ok(CommandTemplate {
            gpu_command: self.gpu.clone(),
            cpu_command: self.cpu.clone(),
        })
    }
}

/// Writes a one-cue subtitle and a stub audio file into `dir`, or fails on request
pub struct FakeTranscriber {
    pub dir: PathBuf,
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl FakeTranscriber {
    pub fn new(dir: &Path, fail: bool) -> Arc<Self> {
        Arc::new(Self {
            dir: dir.to_path_buf(),
            fail,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn transcribe(
        &self,
        video: &Path,
        _cancel: &CancellationToken,
    ) -> Result<TranscriptOutput, TranscribeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(TranscribeError::NoSpeech);
        }
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        let subtitle_path = self.dir.join(format!("{}.srt", stem));
        let audio_path = self.dir.join(format!("{}.wav", stem));
        std::fs::write(&subtitle_path, "1\n00:00:00,000 --> 00:00:01,000\nhi\n")?;
        std::fs::write(&audio_path, b"RIFF")?;
        Ok(TranscriptOutput {
            subtitle_path,
            audio_path,
        })
    }
}

pub fn plan(id: u32) -> Arc<Plan> {
    Arc::new(
        builtin_plans()
            .into_iter()
            .find(|p| p.id == id)
            .expect("builtin plan"),
    )
}
