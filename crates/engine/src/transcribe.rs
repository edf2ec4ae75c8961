//! Subtitle generation stage
//!
//! Subtitle plans need a caption file before the encode can be resolved. The
//! [`Transcriber`] trait is the boundary to the speech recognition engine;
//! [`CommandTranscriber`] drives an external recognizer process and writes SRT.

use crate::config::TranscriptionConfig;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Error type for the transcription stage
#[derive(Debug, Error)]
pub enum TranscribeError {
    /// The source has no audio stream to recognize
    #[error("Source has no audio stream: {0}")]
    NoAudioStream(PathBuf),

    /// Audio extraction through the encoder failed
    #[error("Audio extraction failed: {0}")]
    AudioExtraction(String),

    /// The recognizer could not be prepared or exited unsuccessfully
    #[error("Recognizer failed: {0}")]
    Recognizer(String),

    /// The recognizer output could not be parsed
    #[error("Invalid recognizer output: {0}")]
    InvalidOutput(#[from] serde_json::Error),

    /// Recognition returned no segments
    #[error("No speech detected")]
    NoSpeech,

    /// Stopped by the run's cancellation token
    #[error("Transcription cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Files produced by a successful transcription; the caller owns their cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptOutput {
    pub subtitle_path: PathBuf,
    pub audio_path: PathBuf,
}

/// Boundary to the speech-to-text engine
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        video: &Path,
        cancel: &CancellationToken,
    ) -> Result<TranscriptOutput, TranscribeError>;
}

/// One recognized caption
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SrtSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// Format seconds as an SRT timestamp (`HH:MM:SS,mmm`)
pub fn format_srt_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let secs = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02},{:03}", hours, minutes, secs, millis)
}

/// Render segments as SRT, applying literal text corrections to each caption.
pub fn render_srt(segments: &[SrtSegment], corrections: &HashMap<String, String>) -> String {
    let mut srt = String::new();
    for (i, segment) in segments.iter().enumerate() {
        let mut text = segment.text.trim().to_string();
        for (wrong, right) in corrections {
            text = text.replace(wrong.as_str(), right);
        }
        srt.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            i + 1,
            format_srt_timestamp(segment.start),
            format_srt_timestamp(segment.end),
            text
        ));
    }
    srt
}

/// Check the encoder's stream listing for an audio stream
pub fn has_audio_stream(probe_stderr: &str) -> bool {
    probe_stderr.contains("Audio:")
}

/// Prepared recognizer: program, model and scratch directory
#[derive(Debug)]
struct RecognizerHandle {
    program: String,
    args: Vec<String>,
    model: Option<PathBuf>,
    language: String,
    temp_dir: PathBuf,
}

impl RecognizerHandle {
    async fn init(config: &TranscriptionConfig) -> Result<Self, TranscribeError> {
        if let Some(model) = &config.model {
            if !tokio::fs::try_exists(model).await? {
                return Err(TranscribeError::Recognizer(format!(
                    "model file not found: {}",
                    model.display()
                )));
            }
        }
        tokio::fs::create_dir_all(&config.temp_dir).await?;
        info!(
            recognizer = %config.recognizer,
            temp_dir = %config.temp_dir.display(),
            "Recognizer ready"
        );
        Ok(Self {
            program: config.recognizer.clone(),
            args: config.recognizer_args.clone(),
            model: config.model.clone(),
            language: config.language.clone(),
            temp_dir: config.temp_dir.clone(),
        })
    }

    fn args_for(&self, audio: &Path) -> Vec<String> {
        let model = self
            .model
            .as_ref()
            .map(|m| m.to_string_lossy().to_string())
            .unwrap_or_default();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{audio_file}", &audio.to_string_lossy())
                    .replace("{model}", &model)
                    .replace("{language}", &self.language)
            })
            .collect()
    }
}

/// Transcriber backed by the encoder (audio extraction) and an external
/// recognizer process.
///
/// At most one transcription runs at a time. The recognizer handle is
/// initialized on first use and shared by every later call.
pub struct CommandTranscriber {
    encoder_program: String,
    config: TranscriptionConfig,
    recognizer: OnceCell<RecognizerHandle>,
    in_flight: Mutex<()>,
}

impl CommandTranscriber {
    pub fn new(encoder_program: impl Into<String>, config: TranscriptionConfig) -> Self {
        Self {
            encoder_program: encoder_program.into(),
            config,
            recognizer: OnceCell::new(),
            in_flight: Mutex::new(()),
        }
    }

    async fn handle(&self) -> Result<&RecognizerHandle, TranscribeError> {
        self.recognizer
            .get_or_try_init(|| RecognizerHandle::init(&self.config))
            .await
    }

    async fn probe_audio(&self, video: &Path, cancel: &CancellationToken) -> Result<(), TranscribeError> {
        let probe = Command::new(&self.encoder_program)
            .arg("-hide_banner")
            .arg("-i")
            .arg(video)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        // The probe exits non-zero because no output is given; only stderr matters.
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranscribeError::Cancelled),
            output = probe => output?,
        };
        if has_audio_stream(&String::from_utf8_lossy(&output.stderr)) {
            Ok(())
        } else {
            Err(TranscribeError::NoAudioStream(video.to_path_buf()))
        }
    }

    async fn extract_audio(
        &self,
        video: &Path,
        audio: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TranscribeError> {
        let extract = Command::new(&self.encoder_program)
            .arg("-y")
            .arg("-i")
            .arg(video)
            .args(["-vn", "-ac", "1", "-ar", "16000"])
            .args(["-af", "volume=2,dynaudnorm=f=150:g=15"])
            .args(["-acodec", "pcm_s16le", "-loglevel", "error"])
            .arg(audio)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranscribeError::Cancelled),
            output = extract => output?,
        };
        if !output.status.success() {
            return Err(TranscribeError::AudioExtraction(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn recognize(
        &self,
        handle: &RecognizerHandle,
        audio: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<SrtSegment>, TranscribeError> {
        let recognize = Command::new(&handle.program)
            .args(handle.args_for(audio))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranscribeError::Cancelled),
            output = recognize => output.map_err(|e| {
                TranscribeError::Recognizer(format!("failed to start {}: {}", handle.program, e))
            })?,
        };
        if !output.status.success() {
            return Err(TranscribeError::Recognizer(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let segments: Vec<SrtSegment> = serde_json::from_slice(&output.stdout)?;
        if segments.is_empty() {
            return Err(TranscribeError::NoSpeech);
        }
        Ok(segments)
    }

    async fn run_stages(
        &self,
        handle: &RecognizerHandle,
        video: &Path,
        audio: &Path,
        subtitle: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), TranscribeError> {
        self.probe_audio(video, cancel).await?;
        self.extract_audio(video, audio, cancel).await?;
        debug!(audio = %audio.display(), "Audio extracted");

        let segments = self.recognize(handle, audio, cancel).await?;
        let srt = render_srt(&segments, &self.config.corrections);
        tokio::fs::write(subtitle, srt).await?;
        Ok(())
    }
}

#[async_trait]
impl Transcriber for CommandTranscriber {
    async fn transcribe(
        &self,
        video: &Path,
        cancel: &CancellationToken,
    ) -> Result<TranscriptOutput, TranscribeError> {
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TranscribeError::Cancelled),
            guard = self.in_flight.lock() => guard,
        };
        let handle = self.handle().await?;

        let tag = uuid::Uuid::new_v4().simple().to_string();
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());
        let audio_path = handle.temp_dir.join(format!("temp_{}_audio.wav", &tag[..8]));
        let subtitle_path = handle.temp_dir.join(format!("{}_{}.srt", stem, &tag[..8]));

        info!(video = %video.display(), "Transcribing");
        match self
            .run_stages(handle, video, &audio_path, &subtitle_path, cancel)
            .await
        {
            Ok(()) => {
                info!(subtitle = %subtitle_path.display(), "Subtitles written");
                Ok(TranscriptOutput {
                    subtitle_path,
                    audio_path,
                })
            }
            Err(e) => {
                for partial in [&subtitle_path, &audio_path] {
                    if let Err(rm) = tokio::fs::remove_file(partial).await {
                        if rm.kind() != std::io::ErrorKind::NotFound {
                            warn!(path = %partial.display(), error = %rm, "Failed to remove partial transcription file");
                        }
                    }
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_format_srt_timestamp() {
        assert_eq!(format_srt_timestamp(0.0), "00:00:00,000");
        assert_eq!(format_srt_timestamp(1.5), "00:00:01,500");
        assert_eq!(format_srt_timestamp(61.25), "00:01:01,250");
        assert_eq!(format_srt_timestamp(3723.004), "01:02:03,004");
        assert_eq!(format_srt_timestamp(-3.0), "00:00:00,000");
    }

    #[test]
    fn test_render_srt_numbering_and_corrections() {
        let segments = vec![
            SrtSegment { start: 0.0, end: 1.2, text: "  hello wrold ".to_string() },
            SrtSegment { start: 1.2, end: 2.0, text: "again".to_string() },
        ];
        let mut corrections = HashMap::new();
        corrections.insert("wrold".to_string(), "world".to_string());

        let srt = render_srt(&segments, &corrections);
        assert_eq!(
            srt,
            "1\n00:00:00,000 --> 00:00:01,200\nhello world\n\n\
             2\n00:00:01,200 --> 00:00:02,000\nagain\n\n"
        );
    }

    #[test]
    fn test_has_audio_stream() {
        let with_audio = "Stream #0:0: Video: h264\n  Stream #0:1(und): Audio: aac, 44100 Hz";
        let video_only = "Stream #0:0: Video: h264 (High)";
        assert!(has_audio_stream(with_audio));
        assert!(!has_audio_stream(video_only));
    }

    #[test]
    fn test_segments_parse_from_recognizer_json() {
        let json = r#"[{"start": 0.0, "end": 2.5, "text": "hi"}]"#;
        let segments: Vec<SrtSegment> = serde_json::from_str(json).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "hi");
    }

    #[tokio::test]
    async fn test_missing_model_fails_before_running_anything() {
        let temp = TempDir::new().unwrap();
        let config = TranscriptionConfig {
            model: Some(temp.path().join("missing.bin")),
            temp_dir: temp.path().join("scratch"),
            ..TranscriptionConfig::default()
        };
        let transcriber = CommandTranscriber::new("ffmpeg", config);
        let err = transcriber
            .transcribe(Path::new("/nonexistent.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::Recognizer(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let temp = TempDir::new().unwrap();
        let config = TranscriptionConfig {
            temp_dir: temp.path().to_path_buf(),
            ..TranscriptionConfig::default()
        };
        let transcriber = CommandTranscriber::new("ffmpeg", config);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = transcriber
            .transcribe(Path::new("/nonexistent.mp4"), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TranscribeError::Cancelled));
    }

    /// Shell stand-ins for the encoder and the recognizer
    #[cfg(unix)]
    struct Scripts {
        temp: TempDir,
    }

    #[cfg(unix)]
    impl Scripts {
        fn new() -> Self {
            Self {
                temp: TempDir::new().unwrap(),
            }
        }

        fn write(&self, name: &str, body: &str) -> String {
            use std::os::unix::fs::PermissionsExt;
            let path = self.temp.path().join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path.to_string_lossy().to_string()
        }

        /// Probe lists an audio stream when `audio` is set; extraction writes
        /// its last argument.
        fn encoder(&self, audio: bool) -> String {
            let stream = if audio { "Audio: aac, 44100 Hz" } else { "Video: h264" };
            self.write(
                "encoder",
                &format!(
                    "if [ \"$1\" = \"-hide_banner\" ]; then echo '  Stream #0:1: {}' >&2; exit 1; fi\n\
                     for last; do :; done\n\
                     printf RIFF > \"$last\"",
                    stream
                ),
            )
        }

        /// Counts calls and records overlapping runs through a lock directory.
        fn recognizer(&self) -> String {
            let state = self.temp.path().display().to_string();
            self.write(
                "recognizer",
                &format!(
                    "echo call >> '{state}/calls'\n\
                     if ! mkdir '{state}/lock' 2>/dev/null; then echo overlap >> '{state}/overlaps'; fi\n\
                     sleep 0.2\n\
                     rmdir '{state}/lock' 2>/dev/null\n\
                     echo '[{{\"start\": 0.0, \"end\": 1.5, \"text\": \"hello wrold\"}}]'",
                    state = state
                ),
            )
        }

        fn count(&self, name: &str) -> usize {
            std::fs::read_to_string(self.temp.path().join(name))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn config(&self, recognizer: String) -> TranscriptionConfig {
            let mut corrections = HashMap::new();
            corrections.insert("wrold".to_string(), "world".to_string());
            TranscriptionConfig {
                recognizer,
                recognizer_args: vec!["{audio_file}".to_string()],
                temp_dir: self.temp.path().join("scratch"),
                corrections,
                ..TranscriptionConfig::default()
            }
        }

        fn scratch_files(&self) -> usize {
            std::fs::read_dir(self.temp.path().join("scratch"))
                .map(|entries| entries.count())
                .unwrap_or(0)
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_transcription_writes_srt() {
        let scripts = Scripts::new();
        let transcriber =
            CommandTranscriber::new(scripts.encoder(true), scripts.config(scripts.recognizer()));

        let output = transcriber
            .transcribe(Path::new("/videos/talk.mp4"), &CancellationToken::new())
            .await
            .unwrap();

        let srt = std::fs::read_to_string(&output.subtitle_path).unwrap();
        assert_eq!(srt, "1\n00:00:00,000 --> 00:00:01,500\nhello world\n\n");
        assert!(output.audio_path.exists());
        assert!(output
            .subtitle_path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("talk_"));
        assert_eq!(scripts.count("calls"), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_video_without_audio_is_rejected() {
        let scripts = Scripts::new();
        let transcriber =
            CommandTranscriber::new(scripts.encoder(false), scripts.config(scripts.recognizer()));

        let err = transcriber
            .transcribe(Path::new("/videos/silent.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, TranscribeError::NoAudioStream(_)));
        assert_eq!(scripts.count("calls"), 0);
        assert_eq!(scripts.scratch_files(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_recognizer_failure_removes_partial_files() {
        let scripts = Scripts::new();
        let recognizer = scripts.write("broken", "echo 'model exploded' >&2; exit 3");
        let transcriber = CommandTranscriber::new(scripts.encoder(true), scripts.config(recognizer));

        let err = transcriber
            .transcribe(Path::new("/videos/talk.mp4"), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            TranscribeError::Recognizer(msg) => assert!(msg.contains("model exploded")),
            other => panic!("expected recognizer failure, got {:?}", other),
        }
        assert_eq!(scripts.scratch_files(), 0);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_calls_run_one_at_a_time_and_share_the_recognizer() {
        let scripts = Scripts::new();
        let model = scripts.temp.path().join("model.bin");
        std::fs::write(&model, b"weights").unwrap();
        let mut config = scripts.config(scripts.recognizer());
        config.model = Some(model.clone());
        let transcriber = Arc::new(CommandTranscriber::new(scripts.encoder(true), config));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let transcriber = transcriber.clone();
            tasks.push(tokio::spawn(async move {
                let video = PathBuf::from(format!("/videos/talk{}.mp4", i));
                transcriber.transcribe(&video, &CancellationToken::new()).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(scripts.count("calls"), 3);
        assert_eq!(scripts.count("overlaps"), 0);
        assert!(transcriber.recognizer.initialized());

        // The model is only checked when the handle is first built.
        std::fs::remove_file(&model).unwrap();
        transcriber
            .transcribe(Path::new("/videos/late.mp4"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(scripts.count("calls"), 4);
    }

    #[test]
    fn test_recognizer_args_substitution() {
        let handle = RecognizerHandle {
            program: "rec".to_string(),
            args: vec![
                "-m".to_string(),
                "{model}".to_string(),
                "-l".to_string(),
                "{language}".to_string(),
                "{audio_file}".to_string(),
            ],
            model: Some(PathBuf::from("/models/small.bin")),
            language: "zh".to_string(),
            temp_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(
            handle.args_for(Path::new("/tmp/a.wav")),
            vec!["-m", "/models/small.bin", "-l", "zh", "/tmp/a.wav"]
        );
    }
}
