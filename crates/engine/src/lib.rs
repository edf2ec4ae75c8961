//! Reframe engine
//!
//! Batch transcoding pipeline: directory scanning into jobs, per-job stages
//! (optional transcription, command resolution, supervised encode), worker and
//! GPU arbitration, cooperative cancellation and loop mode.

pub mod arbiter;
pub mod job;
pub mod job_executor;
pub mod orchestrator;
pub mod plan;
pub mod scan;
pub mod session;
pub mod startup;
pub mod status;
pub mod status_server;
pub mod supervisor;
pub mod template;
pub mod transcribe;

#[cfg(test)]
mod testing;

pub use reframe_config as config;
pub use reframe_config::Config;
pub use arbiter::{derive_gpu_limit, GpuPermit, ResourceArbiter, ResourceLimits, WorkerPermit};
pub use job::{Job, JobState, SourceClaim};
pub use job_executor::{ExecutionSettings, JobError, JobExecutor, JobOutcome};
pub use orchestrator::{Orchestrator, RunError};
pub use plan::{builtin_plans, BuiltinPlans, Plan, PlanCatalog, PlanSource, ResolveError};
pub use scan::{build_jobs, has_eligible_files, is_video_file, scan_directory, ScanError};
pub use session::{format_elapsed, Outcome, Session, SessionReport};
pub use startup::{
    check_cpu_templates, check_encoder_available, detect_hardware_flag, parse_ffmpeg_version,
    run_startup_checks, StartupError,
};
pub use status::{
    collect_system_load, new_shared_status, JobStatus, SharedStatus, StatusSnapshot, SystemLoad,
};
pub use status_server::{create_status_router, run_status_server, ServerError};
pub use supervisor::{EncodeError, EncodeReport, EncodeSupervisor, LineClassifier, LineKind};
pub use template::{
    substitute, BuiltinTemplates, CommandTemplate, Substitutions, TemplateRequest, TemplateSource,
};
pub use transcribe::{CommandTranscriber, TranscribeError, Transcriber, TranscriptOutput};
