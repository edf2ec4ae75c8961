//! Run orchestration
//!
//! Scans the input directories into jobs, feeds them through the worker pool
//! and, in loop mode, rescans after each pass until nothing eligible remains
//! or cancellation is requested.

use crate::arbiter::{ResourceArbiter, ResourceLimits};
use crate::config::Config;
use crate::job::Job;
use crate::job_executor::{ExecutionSettings, JobExecutor};
use crate::plan::{Plan, PlanCatalog};
use crate::scan::{build_jobs, exclusions, has_eligible_files, ScanError};
use crate::session::{Outcome, Session, SessionReport};
use crate::status::{collect_system_load, new_shared_status, now_unix_ms, SharedStatus};
use crate::supervisor::EncodeSupervisor;
use crate::template::TemplateSource;
use crate::transcribe::Transcriber;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Interval between status refreshes while a run is active
const STATUS_REFRESH: Duration = Duration::from_millis(500);

/// Run-level failure; per-job failures never surface here
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Scan failed: {0}")]
    Scan(#[from] ScanError),

    #[error("None of the selected plans {0:?} exist")]
    NoPlans(Vec<u32>),

    #[error("No input directories configured")]
    NoInputDirectories,

    #[error("Invalid progress pattern: {0}")]
    Pattern(#[from] regex::Error),
}

pub struct Orchestrator {
    config: Config,
    catalog: PlanCatalog,
    executor: Arc<JobExecutor>,
    arbiter: ResourceArbiter,
    session: Arc<Session>,
    status: SharedStatus,
}

impl Orchestrator {
    /// Wire the run's shared resources together.
    ///
    /// # Arguments
    /// * `config` - Run configuration, read once
    /// * `catalog` - Plans resolved from the plan source for this run
    /// * `templates` - Command-template source
    /// * `transcriber` - Subtitle stage for plans that need it
    pub fn new(
        config: Config,
        catalog: PlanCatalog,
        templates: Arc<dyn TemplateSource>,
        transcriber: Arc<dyn Transcriber>,
    ) -> Result<Self, RunError> {
        let limits = ResourceLimits::derive(&config.pipeline);
        let arbiter = ResourceArbiter::new(limits);
        let session = Arc::new(Session::new());
        let status = new_shared_status();
        let settings = ExecutionSettings {
            more_effects: config.pipeline.more_effects,
            canvas_y: config.pipeline.effective_canvas_y(),
            delete_source: config.pipeline.delete_source,
        };
        let executor = Arc::new(JobExecutor::new(
            arbiter.clone(),
            templates,
            transcriber,
            EncodeSupervisor::new()?,
            session.clone(),
            status.clone(),
            settings,
        ));

        Ok(Self {
            config,
            catalog,
            executor,
            arbiter,
            session,
            status,
        })
    }

    pub fn status(&self) -> SharedStatus {
        self.status.clone()
    }

    pub fn limits(&self) -> ResourceLimits {
        self.arbiter.limits()
    }

    /// Selected plans that exist; unknown ids are logged and skipped.
    fn selected_plans(&self) -> Result<Vec<Arc<Plan>>, RunError> {
        let selected = &self.config.plans.selected;
        let mut plans = Vec::with_capacity(selected.len());
        for id in selected {
            match self.catalog.find(*id) {
                Ok(plan) => plans.push(plan),
                Err(e) => error!(plan = id, error = %e, "Skipping unknown plan"),
            }
        }
        if plans.is_empty() {
            return Err(RunError::NoPlans(selected.clone()));
        }
        Ok(plans)
    }

    /// Periodically refresh host load, resource usage and session totals.
    fn spawn_status_updater(&self, stop: CancellationToken) -> JoinHandle<()> {
        let status = self.status.clone();
        let arbiter = self.arbiter.clone();
        let session = self.session.clone();
        tokio::spawn(async move {
            let mut sys = System::new();
            loop {
                let system = collect_system_load(&mut sys);
                {
                    let mut snapshot = status.write().await;
                    snapshot.system = system;
                    snapshot.gpu_in_use = arbiter.gpu_in_use();
                    snapshot.workers_busy = arbiter.workers_in_use();
                    snapshot.session = session.report();
                    snapshot.timestamp_unix_ms = now_unix_ms();
                }
                tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(STATUS_REFRESH) => {}
                }
            }
        })
    }

    fn excluded_dirs(&self) -> Vec<PathBuf> {
        exclusions(&[
            &self.config.output.directory,
            &self.config.transcription.temp_dir,
        ])
    }

    /// Run passes until done and return the session totals.
    ///
    /// The session spans every pass of a loop-mode run. A loop ends when no
    /// eligible files remain, when cancellation is requested, or after a pass
    /// in which no job succeeded, since rescanning would retry the same files.
    pub async fn run(&self, cancel: CancellationToken) -> Result<SessionReport, RunError> {
        let dirs = &self.config.input.directories;
        if dirs.is_empty() {
            return Err(RunError::NoInputDirectories);
        }
        let plans = self.selected_plans()?;

        if self.config.pipeline.loop_mode && !self.config.pipeline.delete_source {
            warn!("Loop mode without source deletion rescans the same files until a pass makes no progress");
        }
        {
            let resources = self.arbiter.limits();
            let mut status = self.status.write().await;
            status.gpu_limit = resources.gpu;
            status.worker_limit = resources.workers;
        }
        let updater_stop = CancellationToken::new();
        let updater = self.spawn_status_updater(updater_stop.clone());
        let result = self.run_passes(dirs, &plans, &cancel).await;
        updater_stop.cancel();
        if let Err(e) = updater.await {
            warn!(error = %e, "Status updater stopped abnormally");
        }
        result?;

        let report = self.session.report();
        {
            let mut status = self.status.write().await;
            status.session = report.clone();
            status.gpu_in_use = self.arbiter.gpu_in_use();
            status.workers_busy = self.arbiter.workers_in_use();
            status.timestamp_unix_ms = now_unix_ms();
        }
        info!(
            succeeded = report.succeeded,
            failed = report.failed,
            cancelled = report.cancelled,
            elapsed = %report.elapsed,
            "Run finished"
        );
        Ok(report)
    }

    async fn run_passes(
        &self,
        dirs: &[PathBuf],
        plans: &[Arc<Plan>],
        cancel: &CancellationToken,
    ) -> Result<(), RunError> {
        let limits = self.config.input.directory_limits();
        let loop_mode = self.config.pipeline.loop_mode;
        info!(
            workers = self.arbiter.limits().workers,
            gpu = self.arbiter.limits().gpu,
            use_gpu = self.arbiter.limits().use_gpu,
            plans = ?self.config.plans.selected,
            loop_mode,
            "Starting run"
        );

        loop {
            if cancel.is_cancelled() {
                info!("Stop requested before next scan");
                break;
            }

            let excluded = self.excluded_dirs();
            let jobs = build_jobs(
                dirs,
                &limits,
                plans,
                &self.config.output.directory,
                &excluded,
                self.config.pipeline.use_gpu,
            )?;
            self.session.record_pass();
            let succeeded_before = self.session.succeeded();
            info!(jobs = jobs.len(), "Starting pass");

            self.run_pass(jobs, cancel).await;

            if !loop_mode || cancel.is_cancelled() {
                break;
            }
            if !has_eligible_files(dirs, &self.excluded_dirs())? {
                info!("No eligible files remain");
                break;
            }
            if self.session.succeeded() == succeeded_before {
                warn!("Pass finished without a successful job, stopping loop");
                break;
            }
        }
        Ok(())
    }

    /// Dispatch one pass of jobs and wait for all dispatched jobs to finish.
    async fn run_pass(&self, jobs: Vec<Job>, cancel: &CancellationToken) {
        let mut running = JoinSet::new();
        let total = jobs.len();

        for (index, job) in jobs.into_iter().enumerate() {
            let admitted = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = self.arbiter.acquire_worker() => permit.ok(),
            };
            let Some(permit) = admitted else {
                info!(skipped = total - index, "Stop requested, not dispatching remaining jobs");
                break;
            };
            // The stop may have landed while this job waited for a slot.
            if cancel.is_cancelled() {
                info!(skipped = total - index, "Stop requested, not dispatching remaining jobs");
                break;
            }

            self.session.record_dispatch();
            debug!(job = %job.id, source = %job.source.display(), plan = job.plan.id, "Dispatching");
            let executor = self.executor.clone();
            let cancel = cancel.clone();
            running.spawn(async move {
                let _permit = permit;
                executor.execute(job, &cancel).await
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Job task aborted");
                self.session.record(Outcome::Failed);
            }
        }
    }
}
