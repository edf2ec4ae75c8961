//! Resource arbitration for the worker pool and the GPU
//!
//! Two independent bounded pools: worker slots (W), acquired by waiting, and
//! GPU slots (G), acquired without waiting. A job that cannot get a GPU slot
//! immediately takes the CPU path instead of queueing for the GPU.

use crate::config::PipelineConfig;
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Upper bound on the worker pool
pub const MAX_WORKERS: u32 = 32;

/// Limits derived from configuration and the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// Worker pool size
    pub workers: u32,
    /// Concurrent GPU encodes
    pub gpu: u32,
    /// Whether GPU permits are handed out at all
    pub use_gpu: bool,
}

impl ResourceLimits {
    /// Derive limits from the pipeline configuration
    ///
    /// - workers: explicit value, or the logical CPU count when 0; clamped to [1, 32]
    /// - gpu: explicit value, or derived from workers when 0; clamped to [1, workers]
    pub fn derive(cfg: &PipelineConfig) -> Self {
        let requested = if cfg.workers > 0 {
            cfg.workers
        } else {
            num_cpus::get() as u32
        };
        let workers = clamp_workers(requested);

        let gpu = if cfg.gpu_limit > 0 {
            cfg.gpu_limit.min(workers)
        } else {
            derive_gpu_limit(workers)
        };

        Self {
            workers,
            gpu: gpu.max(1),
            use_gpu: cfg.use_gpu,
        }
    }
}

/// Clamp a worker count to [1, MAX_WORKERS]
pub fn clamp_workers(workers: u32) -> u32 {
    workers.clamp(1, MAX_WORKERS)
}

/// GPU slots for a worker pool of the given size
/// - 6 when more than 8 workers
/// - 4 when 5 to 8 workers
/// - one per worker otherwise
pub fn derive_gpu_limit(workers: u32) -> u32 {
    if workers > 8 {
        6
    } else if workers > 4 {
        4
    } else {
        workers
    }
}

/// Admission into the worker pool; the slot frees when this drops.
#[derive(Debug)]
pub struct WorkerPermit {
    _permit: OwnedSemaphorePermit,
}

/// One GPU slot; released exactly once, when this drops.
#[derive(Debug)]
pub struct GpuPermit {
    _permit: OwnedSemaphorePermit,
}

/// Shared worker and GPU pools
#[derive(Debug, Clone)]
pub struct ResourceArbiter {
    limits: ResourceLimits,
    workers: Arc<Semaphore>,
    gpu: Arc<Semaphore>,
}

impl ResourceArbiter {
    pub fn new(limits: ResourceLimits) -> Self {
        Self {
            limits,
            workers: Arc::new(Semaphore::new(limits.workers as usize)),
            gpu: Arc::new(Semaphore::new(limits.gpu as usize)),
        }
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }

    /// Wait for a worker slot
    pub async fn acquire_worker(&self) -> Result<WorkerPermit, AcquireError> {
        let permit = self.workers.clone().acquire_owned().await?;
        Ok(WorkerPermit { _permit: permit })
    }

    /// Take a GPU slot if one is free right now.
    ///
    /// `None` when GPU use is disabled or every slot is taken; the caller then
    /// encodes on the CPU.
    pub fn try_acquire_gpu(&self) -> Option<GpuPermit> {
        if !self.limits.use_gpu {
            return None;
        }
        self.gpu
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| GpuPermit { _permit: permit })
    }

    /// GPU slots currently held
    pub fn gpu_in_use(&self) -> usize {
        self.limits.gpu as usize - self.gpu.available_permits()
    }

    /// Worker slots currently held
    pub fn workers_in_use(&self) -> usize {
        self.limits.workers as usize - self.workers.available_permits()
    }
}
