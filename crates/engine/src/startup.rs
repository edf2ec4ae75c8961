//! Startup checks
//!
//! Preflight checks run before the first scan:
//! - Encoder executable responds to `-version`
//! - Input directories exist and the output directory can be created
//! - CPU command templates carry no hardware encoder flags
//! - The recognition model exists when a subtitle plan is selected

use crate::config::Config;
use crate::plan::{PlanCatalog, ResolveError};
use crate::template::{TemplateRequest, TemplateSource};
use std::path::Path;
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// Hardware encoder flags that must never appear in a CPU template
const FORBIDDEN_HW_FLAGS: &[&str] = &["nvenc", "qsv", "vaapi", "cuda", "amf", "vce", "videotoolbox"];

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Encoder not available: {0}")]
    EncoderUnavailable(String),

    #[error("Input directory missing or not a directory: {0}")]
    InputDirectory(String),

    #[error("Cannot create output directory {0}: {1}")]
    OutputDirectory(String, std::io::Error),

    #[error("CPU template for plan {plan_id} uses hardware flag '{flag}'")]
    HardwareFlagInCpuTemplate { plan_id: u32, flag: &'static str },

    #[error("Recognition model not found: {0}")]
    ModelMissing(String),

    #[error("Template resolution failed: {0}")]
    Resolve(#[from] ResolveError),
}

/// Check if a string contains any forbidden hardware encoder flags
///
/// Returns the first detected forbidden flag, or None if clean.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    FORBIDDEN_HW_FLAGS
        .iter()
        .find(|&&flag| lower.contains(flag))
        .copied()
}

/// Parse an FFmpeg version banner and extract the major version number
///
/// Handles `ffmpeg version 6.1.1 ...` and `ffmpeg version n7.0-...`.
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');
    let major_str = version_str.split(|c| c == '.' || c == '-').next()?;

    major_str.parse().ok()
}

/// Run `<program> -version`; returns the major version when it can be parsed.
pub fn check_encoder_available(program: &str) -> Result<Option<u32>, StartupError> {
    let output = Command::new(program).arg("-version").output().map_err(|e| {
        StartupError::EncoderUnavailable(format!(
            "{} -version failed; is it installed and in PATH? Error: {}",
            program, e
        ))
    })?;

    if !output.status.success() {
        return Err(StartupError::EncoderUnavailable(format!(
            "{} -version exited with {}",
            program, output.status
        )));
    }

    let major = parse_ffmpeg_version(&String::from_utf8_lossy(&output.stdout));
    match major {
        Some(major) => info!(program, major, "Encoder available"),
        None => warn!(program, "Encoder responded but its version could not be parsed"),
    }
    Ok(major)
}

pub fn check_input_directories(dirs: &[impl AsRef<Path>]) -> Result<(), StartupError> {
    for dir in dirs {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(StartupError::InputDirectory(dir.display().to_string()));
        }
    }
    Ok(())
}

pub fn check_output_directory(dir: &Path) -> Result<(), StartupError> {
    std::fs::create_dir_all(dir)
        .map_err(|e| StartupError::OutputDirectory(dir.display().to_string(), e))
}

/// Resolve the CPU template of every selected plan and reject hardware flags.
///
/// Unknown plan ids are left to the run, which skips them.
pub async fn check_cpu_templates(
    cfg: &Config,
    catalog: &PlanCatalog,
    templates: &dyn TemplateSource,
) -> Result<(), StartupError> {
    for id in &cfg.plans.selected {
        let Ok(plan) = catalog.find(*id) else { continue };
        let request = TemplateRequest {
            plan: &plan,
            more_effects: cfg.pipeline.more_effects,
            canvas_y: cfg.pipeline.effective_canvas_y(),
        };
        let pair = templates.command_templates(&request).await?;
        let cpu = pair.select(false, plan.id)?;
        if let Some(flag) = detect_hardware_flag(cpu) {
            return Err(StartupError::HardwareFlagInCpuTemplate {
                plan_id: plan.id,
                flag,
            });
        }
    }
    Ok(())
}

/// A configured model path must exist when a subtitle plan is selected.
pub fn check_transcription_model(cfg: &Config, catalog: &PlanCatalog) -> Result<(), StartupError> {
    let needs_subtitles = cfg
        .plans
        .selected
        .iter()
        .filter_map(|id| catalog.find(*id).ok())
        .any(|plan| plan.add_subtitle);
    if !needs_subtitles {
        return Ok(());
    }
    match &cfg.transcription.model {
        Some(model) if !model.exists() => {
            Err(StartupError::ModelMissing(model.display().to_string()))
        }
        _ => Ok(()),
    }
}

/// Run all startup checks in order
///
/// 1. Encoder availability
/// 2. Input and output directories
/// 3. CPU templates
/// 4. Recognition model
pub async fn run_startup_checks(
    cfg: &Config,
    catalog: &PlanCatalog,
    templates: &dyn TemplateSource,
) -> Result<(), StartupError> {
    check_encoder_available(&cfg.encoder.program)?;
    check_input_directories(&cfg.input.directories)?;
    check_output_directory(&cfg.output.directory)?;
    check_cpu_templates(cfg, catalog, templates).await?;
    check_transcription_model(cfg, catalog)?;
    Ok(())
}
