//! 调度器指标

use std::time::Duration;

use ::metrics::{counter, gauge, histogram, Counter, Gauge};

/// 调度器运行指标，通过 `metrics` 门面记录，由宿主进程决定导出方式
#[derive(Clone)]
pub struct SchedulerMetrics {
    triggers_acquired_total: Counter,
    jobs_executed_total: Counter,
    job_failures_total: Counter,
    misfires_handled_total: Counter,
    recovered_fired_triggers_total: Counter,
    busy_workers: Gauge,
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            triggers_acquired_total: counter!("scheduler_triggers_acquired_total"),
            jobs_executed_total: counter!("scheduler_jobs_executed_total"),
            job_failures_total: counter!("scheduler_job_failures_total"),
            misfires_handled_total: counter!("scheduler_misfires_handled_total"),
            recovered_fired_triggers_total: counter!("scheduler_recovered_fired_triggers_total"),
            busy_workers: gauge!("scheduler_busy_workers"),
        }
    }

    pub fn record_triggers_acquired(&self, count: usize) {
        self.triggers_acquired_total.increment(count as u64);
    }

    pub fn record_job_executed(&self, job_type: &str, succeeded: bool, duration: Duration) {
        self.jobs_executed_total.increment(1);
        if !succeeded {
            self.job_failures_total.increment(1);
        }
        histogram!("scheduler_job_execution_duration_seconds", "job_type" => job_type.to_string())
            .record(duration.as_secs_f64());
    }

    pub fn record_misfires_handled(&self, count: usize) {
        self.misfires_handled_total.increment(count as u64);
    }

    pub fn record_recovered(&self, count: usize) {
        self.recovered_fired_triggers_total.increment(count as u64);
    }

    pub fn record_store_operation(&self, operation: &'static str, duration: Duration) {
        histogram!("scheduler_store_operation_duration_seconds", "operation" => operation)
            .record(duration.as_secs_f64());
    }

    pub fn set_busy_workers(&self, busy: usize) {
        self.busy_workers.set(busy as f64);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SchedulerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerMetrics").finish_non_exhaustive()
    }
}
