//! 有界执行池
//!
//! 用信号量表示执行槽：调度循环先查询空闲槽数再获取触发器，提交时占用一个槽，
//! 执行结束释放。执行结果通过通道发回调度循环。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_core::SchedulerMetrics;
use scheduler_domain::{now_millis, JobKey, TriggerKey};
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::run_shell::{JobCompletion, JobRunShell};

/// 正在执行的作业
#[derive(Debug, Clone)]
pub struct RunningJob {
    pub fire_instance_id: String,
    pub job_key: JobKey,
    pub trigger_key: TriggerKey,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub recovering: bool,
    cancellation: CancellationToken,
}

impl RunningJob {
    pub fn is_interrupted(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

pub struct WorkerPool {
    size: usize,
    slots: Arc<Semaphore>,
    running: Arc<RwLock<HashMap<String, RunningJob>>>,
    completions: mpsc::UnboundedSender<JobCompletion>,
    metrics: SchedulerMetrics,
    shut_down: AtomicBool,
}

impl WorkerPool {
    /// 创建执行池，返回执行结果的接收端
    pub fn new(size: usize, metrics: SchedulerMetrics) -> (Self, mpsc::UnboundedReceiver<JobCompletion>) {
        let size = size.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        info!(size, "创建作业执行池");
        let pool = Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            running: Arc::new(RwLock::new(HashMap::new())),
            completions: tx,
            metrics,
            shut_down: AtomicBool::new(false),
        };
        (pool, rx)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_slots(&self) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }
        self.slots.available_permits()
    }

    pub fn busy_count(&self) -> usize {
        self.size.saturating_sub(self.slots.available_permits())
    }

    /// 等待至少一个空闲槽，最多等待 `max_wait`；返回当前空闲槽数
    pub async fn block_for_available_slots(&self, max_wait: Duration) -> usize {
        if self.shut_down.load(Ordering::SeqCst) {
            return 0;
        }
        if let Ok(Ok(permit)) = tokio::time::timeout(max_wait, self.slots.acquire()).await {
            drop(permit);
        }
        self.available_slots()
    }

    /// 提交执行；没有空闲槽时返回错误，调用方应先通过 available_slots 预留
    pub async fn submit(&self, shell: JobRunShell) -> SchedulerResult<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(SchedulerError::SchedulerShutdown);
        }
        let permit = self
            .slots
            .clone()
            .try_acquire_owned()
            .map_err(|_| SchedulerError::Internal("执行池没有空闲的执行槽".to_string()))?;

        let bundle = shell.bundle();
        let running_job = RunningJob {
            fire_instance_id: bundle.fire_instance_id.clone(),
            job_key: bundle.job.key.clone(),
            trigger_key: bundle.trigger.key.clone(),
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            started_at: now_millis(),
            recovering: bundle.recovering,
            cancellation: shell.cancellation_token(),
        };
        let fire_instance_id = running_job.fire_instance_id.clone();
        self.running
            .write()
            .await
            .insert(fire_instance_id.clone(), running_job);
        self.metrics.set_busy_workers(self.busy_count());

        let running = Arc::clone(&self.running);
        let completions = self.completions.clone();
        let metrics = self.metrics.clone();
        let slots = Arc::clone(&self.slots);
        let size = self.size;
        tokio::spawn(async move {
            let completion = shell.run().await;
            running.write().await.remove(&fire_instance_id);
            drop(permit);
            metrics.set_busy_workers(size.saturating_sub(slots.available_permits()));
            if completions.send(completion).is_err() {
                warn!(fire_instance_id = %fire_instance_id, "调度循环已停止，执行结果被丢弃");
            }
        });
        Ok(())
    }

    pub async fn running_jobs(&self) -> Vec<RunningJob> {
        let running = self.running.read().await;
        let mut jobs: Vec<RunningJob> = running.values().cloned().collect();
        jobs.sort_by_key(|j| j.started_at);
        jobs
    }

    /// 向作业的所有正在执行的实例发出中断信号，返回实例数
    pub async fn interrupt_job(&self, job_key: &JobKey) -> usize {
        let running = self.running.read().await;
        let mut interrupted = 0;
        for job in running.values().filter(|j| &j.job_key == job_key) {
            job.cancellation.cancel();
            interrupted += 1;
        }
        if interrupted > 0 {
            info!(job = %job_key, interrupted, "已发出中断信号");
        }
        interrupted
    }

    pub async fn interrupt_instance(&self, fire_instance_id: &str) -> bool {
        let running = self.running.read().await;
        match running.get(fire_instance_id) {
            Some(job) => {
                job.cancellation.cancel();
                info!(job = %job.job_key, fire_instance_id, "已发出中断信号");
                true
            }
            None => false,
        }
    }

    /// 停止接收新的执行；`wait_for_jobs` 为 true 时等待正在执行的作业结束
    pub async fn shutdown(&self, wait_for_jobs: bool, interrupt: bool) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        if interrupt {
            for job in self.running.read().await.values() {
                job.cancellation.cancel();
            }
        }
        if wait_for_jobs {
            debug!(busy = self.busy_count(), "等待正在执行的作业结束");
            if let Ok(all) = self.slots.acquire_many(self.size as u32).await {
                drop(all);
            }
        }
        info!(wait_for_jobs, "作业执行池已关闭");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("busy", &self.busy_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scheduler_core::JobRegistry;
    use scheduler_domain::{
        CompletedExecutionInstruction, Job, JobDetail, JobExecutionContext, JobExecutionError,
        Schedule, Trigger, TriggerFiredBundle,
    };

    use crate::listeners::ListenerManager;

    struct WaitForInterrupt;

    #[async_trait]
    impl Job for WaitForInterrupt {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            ctx.interrupted().await;
            Err(JobExecutionError::new("被中断"))
        }
    }

    fn shell(name: &str, registry: &JobRegistry) -> JobRunShell {
        let job_key = JobKey::with_default_group(name);
        let trigger = Trigger::new(TriggerKey::with_default_group(name), job_key.clone(), Schedule::once());
        let bundle = TriggerFiredBundle {
            job: JobDetail::new(job_key, "wait"),
            fire_time: trigger.start_time,
            scheduled_fire_time: Some(trigger.start_time),
            previous_fire_time: None,
            next_fire_time: None,
            trigger,
            calendar: None,
            recovering: false,
            fire_instance_id: format!("fi-{name}"),
        };
        JobRunShell::new(
            bundle,
            registry.clone(),
            Arc::new(ListenerManager::new()),
            SchedulerMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_slots_are_bounded_and_released() {
        let registry = JobRegistry::new();
        registry.register("wait", Arc::new(WaitForInterrupt)).await.unwrap();
        let (pool, mut completions) = WorkerPool::new(1, SchedulerMetrics::new());

        pool.submit(shell("a", &registry)).await.unwrap();
        assert_eq!(pool.available_slots(), 0);
        assert!(pool.submit(shell("b", &registry)).await.is_err());
        assert_eq!(pool.running_jobs().await.len(), 1);

        assert!(pool.interrupt_instance("fi-a").await);
        let completion = completions.recv().await.unwrap();
        assert_eq!(completion.fire_instance_id, "fi-a");
        assert_eq!(completion.instruction, CompletedExecutionInstruction::DeleteTrigger);

        assert_eq!(pool.block_for_available_slots(Duration::from_secs(1)).await, 1);
        assert!(pool.running_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_and_waits() {
        let registry = JobRegistry::new();
        registry.register("wait", Arc::new(WaitForInterrupt)).await.unwrap();
        let (pool, mut completions) = WorkerPool::new(2, SchedulerMetrics::new());
        pool.submit(shell("a", &registry)).await.unwrap();
        pool.submit(shell("b", &registry)).await.unwrap();

        pool.shutdown(true, true).await;
        assert_eq!(pool.busy_count(), 0);
        assert!(pool.is_shut_down());
        assert_eq!(pool.available_slots(), 0);
        assert!(completions.recv().await.is_some());
        assert!(completions.recv().await.is_some());
        assert!(matches!(
            pool.submit(shell("c", &registry)).await,
            Err(SchedulerError::SchedulerShutdown)
        ));
    }

    #[tokio::test]
    async fn test_interrupt_job_by_key() {
        let registry = JobRegistry::new();
        registry.register("wait", Arc::new(WaitForInterrupt)).await.unwrap();
        let (pool, mut completions) = WorkerPool::new(2, SchedulerMetrics::new());
        pool.submit(shell("a", &registry)).await.unwrap();

        assert_eq!(pool.interrupt_job(&JobKey::with_default_group("missing")).await, 0);
        assert_eq!(pool.interrupt_job(&JobKey::with_default_group("a")).await, 1);
        let completion = completions.recv().await.unwrap();
        assert!(completion.error.is_some());
    }
}
