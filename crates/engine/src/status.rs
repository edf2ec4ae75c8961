//! Live run status
//!
//! A snapshot of in-flight jobs, resource usage and session counters, shared
//! between the workers and the optional status server.

use crate::session::SessionReport;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::sync::RwLock;

/// Finished jobs kept in the snapshot
pub const RECENT_JOBS: usize = 20;

/// Per-job view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobStatus {
    pub id: String,
    pub source: String,
    pub destination: String,
    pub plan_id: u32,
    pub stage: String,
    pub gpu: bool,
    pub last_progress: Option<String>,
    pub detail: Option<String>,
}

/// Host load, sampled periodically during a run
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SystemLoad {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StatusSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobStatus>,
    pub recent: VecDeque<JobStatus>,
    pub gpu_in_use: usize,
    pub gpu_limit: u32,
    pub workers_busy: usize,
    pub worker_limit: u32,
    pub system: SystemLoad,
    pub session: SessionReport,
}

/// Shared status for concurrent access across workers and the server
pub type SharedStatus = Arc<RwLock<StatusSnapshot>>;

pub fn new_shared_status() -> SharedStatus {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

pub fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Sample host load; `sys` is reused so CPU usage has a previous reading to diff against.
pub fn collect_system_load(sys: &mut System) -> SystemLoad {
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let total_memory = sys.total_memory();
    let mem_usage = if total_memory > 0 {
        (sys.used_memory() as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    SystemLoad {
        cpu_usage_percent: sys.global_cpu_usage(),
        mem_usage_percent: mem_usage,
        load_avg_1: System::load_average().one as f32,
    }
}

impl StatusSnapshot {
    /// Insert or replace an in-flight job entry
    pub fn upsert_job(&mut self, job: JobStatus) {
        self.timestamp_unix_ms = now_unix_ms();
        match self.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(existing) => *existing = job,
            None => self.jobs.push(job),
        }
    }

    pub fn set_progress(&mut self, id: &str, timestamp: &str) {
        if let Some(job) = self.jobs.iter_mut().find(|j| j.id == id) {
            job.last_progress = Some(timestamp.to_string());
            self.timestamp_unix_ms = now_unix_ms();
        }
    }

    /// Move a job from the in-flight list to the recent list
    pub fn finish_job(&mut self, job: JobStatus) {
        self.timestamp_unix_ms = now_unix_ms();
        self.jobs.retain(|j| j.id != job.id);
        self.recent.push_front(job);
        self.recent.truncate(RECENT_JOBS);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job(id: &str, stage: &str) -> JobStatus {
        JobStatus {
            id: id.to_string(),
            source: format!("/in/{}.mp4", id),
            destination: format!("/out/in/{}.mp4", id),
            plan_id: 1,
            stage: stage.to_string(),
            gpu: false,
            last_progress: None,
            detail: None,
        }
    }

    #[test]
    fn test_upsert_replaces_existing_entry() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.upsert_job(job("a", "created"));
        snapshot.upsert_job(job("b", "created"));
        snapshot.upsert_job(job("a", "encoding"));

        assert_eq!(snapshot.jobs.len(), 2);
        assert_eq!(snapshot.jobs[0].stage, "encoding");
        assert!(snapshot.timestamp_unix_ms > 0);
    }

    #[test]
    fn test_system_load_is_in_range() {
        let mut sys = System::new();
        let load = collect_system_load(&mut sys);
        assert!(load.mem_usage_percent >= 0.0 && load.mem_usage_percent <= 100.0);
        assert!(load.load_avg_1 >= 0.0);
    }

    #[test]
    fn test_progress_ignores_unknown_job() {
        let mut snapshot = StatusSnapshot::default();
        snapshot.upsert_job(job("a", "encoding"));
        snapshot.set_progress("a", "00:00:03.00");
        snapshot.set_progress("zzz", "00:00:04.00");

        assert_eq!(snapshot.jobs[0].last_progress.as_deref(), Some("00:00:03.00"));
        assert_eq!(snapshot.jobs.len(), 1);
    }

    // Finishing any sequence of jobs never grows the recent list past its cap
    // and always removes the job from the in-flight list.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]
        #[test]
        fn prop_finish_job_bounds_recent(count in 0usize..60) {
            let mut snapshot = StatusSnapshot::default();
            for i in 0..count {
                snapshot.upsert_job(job(&format!("job-{}", i), "encoding"));
            }
            for i in 0..count {
                snapshot.finish_job(job(&format!("job-{}", i), "succeeded"));
            }

            prop_assert!(snapshot.jobs.is_empty());
            prop_assert_eq!(snapshot.recent.len(), count.min(RECENT_JOBS));
            if count > 0 {
                let newest = format!("job-{}", count - 1);
                prop_assert_eq!(&snapshot.recent[0].id, &newest);
            }
        }
    }
}
