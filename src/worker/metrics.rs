use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use sysinfo::System;

/// Load reported to the master in every `LoadResponse`.
///
/// Combines CPU usage, memory pressure and the number of tasks running on this
/// worker into a single figure, roughly on a 0-100 scale plus a fixed amount
/// per active task.
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Tasks currently executing
    active_tasks: Arc<AtomicU64>,
    total_tasks: Arc<AtomicU64>,
    system: Arc<Mutex<System>>,
}

/// Load added for every task still running.
pub const LOAD_PER_TASK: f64 = 10.0;

impl WorkerMetrics {
    pub fn new() -> Self {
        Self {
            active_tasks: Arc::new(AtomicU64::new(0)),
            total_tasks: Arc::new(AtomicU64::new(0)),
            system: Arc::new(Mutex::new(System::new())),
        }
    }

    /// Average CPU usage across all cores, 0.0 to 100.0.
    pub fn cpu_usage(&self) -> f64 {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_cpu_all();
        sys.global_cpu_usage() as f64
    }

    /// Share of memory in use, 0.0 to 100.0.
    pub fn memory_usage(&self) -> f64 {
        let mut sys = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        sys.refresh_memory();

        let total = sys.total_memory();
        if total == 0 {
            return 0.0;
        }
        100.0 - (sys.available_memory() as f64 / total as f64) * 100.0
    }

    pub fn active_tasks(&self) -> u64 {
        self.active_tasks.load(Ordering::Relaxed)
    }

    pub fn total_tasks(&self) -> u64 {
        self.total_tasks.load(Ordering::Relaxed)
    }

    pub fn task_started(&self) {
        self.active_tasks.fetch_add(1, Ordering::Relaxed);
        self.total_tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_finished(&self) {
        // Saturate at zero rather than wrap.
        let _ = self
            .active_tasks
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    /// Weighted load: 70% CPU, 30% memory, plus [`LOAD_PER_TASK`] per running task.
    pub fn load(&self) -> f64 {
        const CPU_WEIGHT: f64 = 0.7;
        const MEMORY_WEIGHT: f64 = 0.3;

        let machine = CPU_WEIGHT * self.cpu_usage() + MEMORY_WEIGHT * self.memory_usage();
        machine + LOAD_PER_TASK * self.active_tasks() as f64
    }
}

impl Default for WorkerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
