//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Pipeline behaviour: concurrency, GPU usage and per-run switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineConfig {
    /// Worker pool size (0 = derive from CPU count)
    #[serde(default)]
    pub workers: u32,
    /// Concurrent GPU encodes (0 = derive from worker count)
    #[serde(default)]
    pub gpu_limit: u32,
    /// Try the GPU command variant when a GPU permit is free
    #[serde(default = "default_true")]
    pub use_gpu: bool,
    /// Use the decorative-effects filter chain for non-blur plans
    #[serde(default)]
    pub more_effects: bool,
    /// Delete the source after a verified successful encode
    #[serde(default)]
    pub delete_source: bool,
    /// Rescan input directories after each pass until nothing is left
    #[serde(default)]
    pub loop_mode: bool,
    /// Vertical position of the subtitle box as a fraction of the canvas (0-1)
    #[serde(default = "default_canvas_y")]
    pub canvas_y: f32,
}

fn default_true() -> bool {
    true
}

fn default_canvas_y() -> f32 {
    0.6
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            gpu_limit: 0,
            use_gpu: true,
            more_effects: false,
            delete_source: false,
            loop_mode: false,
            canvas_y: default_canvas_y(),
        }
    }
}

impl PipelineConfig {
    /// Canvas position clamped to [0.0, 1.0]; NaN falls back to the default.
    pub fn effective_canvas_y(&self) -> f32 {
        if self.canvas_y.is_nan() {
            return default_canvas_y();
        }
        self.canvas_y.clamp(0.0, 1.0)
    }
}

/// Input directories and per-directory caps
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct InputConfig {
    /// Directories scanned for source videos
    #[serde(default)]
    pub directories: Vec<PathBuf>,
    /// Cap applied to directories without an explicit entry (0 = unlimited)
    #[serde(default)]
    pub default_limit: usize,
    /// Per-directory caps (0 = unlimited)
    #[serde(default)]
    pub limits: HashMap<PathBuf, usize>,
}

impl InputConfig {
    /// Snapshot of the caps used by the scanner
    pub fn directory_limits(&self) -> DirectoryLimits {
        DirectoryLimits {
            default_limit: self.default_limit,
            limits: self.limits.clone(),
        }
    }
}

/// Read-only view of the per-directory file caps
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DirectoryLimits {
    default_limit: usize,
    limits: HashMap<PathBuf, usize>,
}

impl DirectoryLimits {
    pub fn new(default_limit: usize, limits: HashMap<PathBuf, usize>) -> Self {
        Self {
            default_limit,
            limits,
        }
    }

    /// Cap for `dir`; an explicit entry wins over the global default. 0 means unlimited.
    pub fn limit_for(&self, dir: &Path) -> usize {
        self.limits
            .get(dir)
            .copied()
            .unwrap_or(self.default_limit)
    }
}

/// Output location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Root directory; each input directory gets a subdirectory named after it
    #[serde(default = "default_output_dir")]
    pub directory: PathBuf,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
        }
    }
}

/// Which plans every source file is crossed with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlansConfig {
    #[serde(default = "default_selected_plans")]
    pub selected: Vec<u32>,
}

fn default_selected_plans() -> Vec<u32> {
    vec![1]
}

impl Default for PlansConfig {
    fn default() -> Self {
        Self {
            selected: default_selected_plans(),
        }
    }
}

/// External encoder invocation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// Encoder program used for probing, audio extraction and startup checks
    #[serde(default = "default_encoder_program")]
    pub program: String,
}

fn default_encoder_program() -> String {
    "ffmpeg".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            program: default_encoder_program(),
        }
    }
}

/// Speech recognition used by subtitle plans
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptionConfig {
    /// Recognizer program; must print JSON segments `[{start, end, text}]` on stdout
    #[serde(default = "default_recognizer")]
    pub recognizer: String,
    /// Extra arguments; `{audio_file}`, `{model}` and `{language}` are substituted
    #[serde(default = "default_recognizer_args")]
    pub recognizer_args: Vec<String>,
    /// Model file handed to the recognizer
    #[serde(default)]
    pub model: Option<PathBuf>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Scratch directory for extracted audio and generated subtitles
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Literal text replacements applied to every recognized segment
    #[serde(default)]
    pub corrections: HashMap<String, String>,
}

fn default_recognizer() -> String {
    "whisper-segments".to_string()
}

fn default_recognizer_args() -> Vec<String> {
    vec![
        "--model".to_string(),
        "{model}".to_string(),
        "--language".to_string(),
        "{language}".to_string(),
        "{audio_file}".to_string(),
    ]
}

fn default_language() -> String {
    "zh".to_string()
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            recognizer: default_recognizer(),
            recognizer_args: default_recognizer_args(),
            model: None,
            language: default_language(),
            temp_dir: default_temp_dir(),
            corrections: HashMap::new(),
        }
    }
}

/// Local status endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "127.0.0.1:7879".to_string()
}

impl Default for StatusServerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_bind(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub plans: PlansConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub transcription: TranscriptionConfig,
    #[serde(default)]
    pub status_server: StatusServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Missing sections and fields fall back to their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - REFRAME_WORKERS -> pipeline.workers
    /// - REFRAME_GPU_LIMIT -> pipeline.gpu_limit
    /// - REFRAME_USE_GPU -> pipeline.use_gpu
    /// - REFRAME_LOOP -> pipeline.loop_mode
    /// - REFRAME_DELETE_SOURCE -> pipeline.delete_source
    /// - REFRAME_CANVAS_Y -> pipeline.canvas_y
    /// - REFRAME_OUTPUT_DIR -> output.directory
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("REFRAME_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.pipeline.workers = workers;
            }
        }

        if let Ok(val) = env::var("REFRAME_GPU_LIMIT") {
            if let Ok(limit) = val.parse::<u32>() {
                self.pipeline.gpu_limit = limit;
            }
        }

        if let Some(flag) = env_flag("REFRAME_USE_GPU") {
            self.pipeline.use_gpu = flag;
        }

        if let Some(flag) = env_flag("REFRAME_LOOP") {
            self.pipeline.loop_mode = flag;
        }

        if let Some(flag) = env_flag("REFRAME_DELETE_SOURCE") {
            self.pipeline.delete_source = flag;
        }

        if let Ok(val) = env::var("REFRAME_CANVAS_Y") {
            if let Ok(canvas_y) = val.parse::<f32>() {
                self.pipeline.canvas_y = canvas_y;
            }
        }

        if let Ok(val) = env::var("REFRAME_OUTPUT_DIR") {
            if !val.is_empty() {
                self.output.directory = PathBuf::from(val);
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }
}

/// Accepts "true", "1", "yes" and "false", "0", "no"; anything else is ignored.
fn env_flag(name: &str) -> Option<bool> {
    let val = env::var(name).ok()?;
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
