//! 调度循环
//!
//! 每一轮：等待空闲执行槽 → 获取即将到期的触发器 → 等到触发时间 →
//! 确认触发 → 交给执行池。等待期间收到更早的调度变更时放回已获取的触发器。

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{bounded_millis, JobRegistry, SchedulerConfig, SchedulerMetrics};
use scheduler_domain::{
    now_millis, CompletedExecutionInstruction, JobStore, Trigger, TriggerFiredResult,
};
use scheduler_worker::{JobRunShell, ListenerManager, WorkerPool};

use crate::health::HealthReporter;
use crate::signal::SchedulingSignal;

/// 距离触发时间不足该值即视为到期
const FIRE_TOLERANCE_MS: i64 = 2;

/// 调度器运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    /// 已创建，尚未启动
    Stopped,
    Running,
    /// 待机：不再获取触发器，正在执行的作业不受影响
    Paused,
    ShutDown,
}

#[derive(Debug, Clone)]
pub(crate) struct DispatchSettings {
    pub idle_wait: Duration,
    pub max_batch_size: usize,
    pub batch_time_window: chrono::Duration,
    pub db_failure_retry_interval: Duration,
    pub job_timeout: Option<Duration>,
}

impl DispatchSettings {
    pub fn from_config(config: &SchedulerConfig, job_timeout: Option<Duration>) -> Self {
        Self {
            idle_wait: config.idle_wait_time(),
            max_batch_size: config.batch_trigger_acquisition_max_count,
            batch_time_window: bounded_millis(config.batch_trigger_acquisition_fire_ahead_time_window_ms),
            db_failure_retry_interval: config.db_failure_retry_interval(),
            job_timeout,
        }
    }

    /// 空闲等待加入最多 20% 的随机提前量，避免集群节点同时访问存储
    fn randomized_idle_wait(&self) -> Duration {
        let base = self.idle_wait.as_millis() as u64;
        let variance = base / 5;
        if variance == 0 {
            return self.idle_wait;
        }
        let jitter = rand::rng().random_range(0..variance);
        Duration::from_millis(base - jitter)
    }
}

pub(crate) struct SchedulerThread {
    pub store: Arc<dyn JobStore>,
    pub pool: Arc<WorkerPool>,
    pub registry: JobRegistry,
    pub listeners: Arc<ListenerManager>,
    pub metrics: SchedulerMetrics,
    pub signal: Arc<SchedulingSignal>,
    pub health: HealthReporter,
    pub state: watch::Receiver<SchedulerState>,
    pub halt: CancellationToken,
    pub settings: DispatchSettings,
}

impl SchedulerThread {
    pub async fn run(mut self) {
        info!("调度循环已启动");
        let mut failures: u32 = 0;

        loop {
            if !self.wait_until_running().await {
                break;
            }

            let available = tokio::select! {
                n = self.pool.block_for_available_slots(self.settings.idle_wait) => n,
                _ = self.halt.cancelled() => break,
            };
            if available == 0 {
                continue;
            }

            let now = now_millis();
            self.signal.clear();
            let idle_wait_ms = u64::try_from(self.settings.idle_wait.as_millis()).unwrap_or(u64::MAX);
            let no_later_than = now + bounded_millis(idle_wait_ms);
            let max_count = available.min(self.settings.max_batch_size);

            let triggers = match self
                .store
                .acquire_next_triggers(no_later_than, max_count, self.settings.batch_time_window)
                .await
            {
                Ok(triggers) => {
                    if failures > 0 {
                        info!(failures, "存储访问已恢复");
                    }
                    failures = 0;
                    self.health.report_success();
                    triggers
                }
                Err(e) => {
                    failures += 1;
                    let message = format!("获取待触发的触发器失败: {e}");
                    if failures == 1 || failures % 4 == 0 {
                        error!(error = %e, failures, "获取待触发的触发器失败");
                        self.listeners.notify_scheduler_error(&message).await;
                    }
                    self.health.report_failure(message);
                    self.sleep_or_halt(self.settings.db_failure_retry_interval).await;
                    continue;
                }
            };

            if triggers.is_empty() {
                let wait = self.settings.randomized_idle_wait();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.signal.notified() => debug!("收到调度变更，结束空闲等待"),
                    _ = self.halt.cancelled() => {}
                    _ = self.state.changed() => {}
                }
                continue;
            }

            let Some(triggers) = self.wait_for_fire_time(triggers).await else {
                continue;
            };
            self.fire(triggers).await;
        }

        info!("调度循环已停止");
    }

    /// 待机时阻塞；返回 false 表示应退出循环
    async fn wait_until_running(&mut self) -> bool {
        loop {
            // 发送端已释放说明调度器已被丢弃
            if self.halt.is_cancelled() || self.state.has_changed().is_err() {
                return false;
            }
            match *self.state.borrow_and_update() {
                SchedulerState::Running => return true,
                SchedulerState::ShutDown => return false,
                SchedulerState::Stopped | SchedulerState::Paused => {}
            }
            tokio::select! {
                changed = self.state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
                _ = self.halt.cancelled() => return false,
            }
        }
    }

    fn is_running(&self) -> bool {
        *self.state.borrow() == SchedulerState::Running
            && !self.halt.is_cancelled()
            && self.state.has_changed().is_ok()
    }

    async fn sleep_or_halt(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.halt.cancelled() => {}
        }
    }

    /// 等到第一个触发器的触发时间；被更早的变更打断或停止时放回全部触发器
    async fn wait_for_fire_time(&mut self, triggers: Vec<Trigger>) -> Option<Vec<Trigger>> {
        let Some(fire_time) = triggers.first().and_then(|t| t.next_fire_time) else {
            self.release_all(&triggers).await;
            return None;
        };

        loop {
            let now = now_millis();
            if is_due(fire_time, now) {
                return Some(triggers);
            }
            if !self.is_running() {
                debug!(count = triggers.len(), "调度器不再运行，放回已获取的触发器");
                self.release_all(&triggers).await;
                return None;
            }
            if self.signal.take_if_earlier(fire_time, now) {
                debug!(fire_time = %fire_time, "出现更早的触发时间，放回已获取的触发器");
                self.release_all(&triggers).await;
                return None;
            }

            let sleep_for = (fire_time - now).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.signal.notified() => {}
                _ = self.halt.cancelled() => {}
                _ = self.state.changed() => {}
            }
        }
    }

    async fn release_all(&self, triggers: &[Trigger]) {
        for trigger in triggers {
            if let Err(e) = self.store.release_acquired_trigger(trigger).await {
                error!(trigger = %trigger.key, error = %e, "放回已获取的触发器失败");
            }
        }
    }

    async fn fire(&self, triggers: Vec<Trigger>) {
        let results = match self.store.triggers_fired(&triggers).await {
            Ok(results) => results,
            Err(e) => {
                error!(error = %e, count = triggers.len(), "确认触发失败，放回触发器");
                self.listeners
                    .notify_scheduler_error(&format!("确认触发失败: {e}"))
                    .await;
                self.release_all(&triggers).await;
                return;
            }
        };

        for result in results {
            match result {
                TriggerFiredResult::Fired(bundle) => {
                    let trigger = bundle.trigger.clone();
                    let job = bundle.job.clone();
                    debug!(
                        trigger = %trigger.key,
                        job = %job.key,
                        fire_instance_id = %bundle.fire_instance_id,
                        "触发作业"
                    );
                    let shell = JobRunShell::new(
                        *bundle,
                        self.registry.clone(),
                        Arc::clone(&self.listeners),
                        self.metrics.clone(),
                    )
                    .with_timeout(self.settings.job_timeout);

                    if let Err(e) = self.pool.submit(shell).await {
                        error!(trigger = %trigger.key, error = %e, "提交作业到执行池失败");
                        if let Err(e) = self
                            .store
                            .triggered_job_complete(
                                &trigger,
                                &job,
                                CompletedExecutionInstruction::SetAllJobTriggersError,
                            )
                            .await
                        {
                            error!(trigger = %trigger.key, error = %e, "标记触发器错误状态失败");
                        }
                    }
                }
                TriggerFiredResult::Failed { trigger, error } => {
                    warn!(trigger = %trigger.key, error = %error, "触发器无法触发");
                    self.listeners
                        .notify_scheduler_error(&format!("触发器 {} 无法触发: {error}", trigger.key))
                        .await;
                    if let Err(e) = self.store.release_acquired_trigger(&trigger).await {
                        error!(trigger = %trigger.key, error = %e, "放回触发器失败");
                    }
                }
            }
        }
    }
}

fn is_due(fire_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    (fire_time - now).num_milliseconds() <= FIRE_TOLERANCE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_randomized_idle_wait_stays_within_bounds() {
        let settings = DispatchSettings {
            idle_wait: Duration::from_millis(1_000),
            max_batch_size: 1,
            batch_time_window: chrono::Duration::zero(),
            db_failure_retry_interval: Duration::from_millis(100),
            job_timeout: None,
        };
        for _ in 0..50 {
            let wait = settings.randomized_idle_wait();
            assert!(wait <= Duration::from_millis(1_000));
            assert!(wait > Duration::from_millis(800));
        }
    }

    #[test]
    fn test_is_due_tolerance() {
        let now = now_millis();
        assert!(is_due(now, now));
        assert!(is_due(now + chrono::Duration::milliseconds(2), now));
        assert!(!is_due(now + chrono::Duration::milliseconds(50), now));
    }
}
