//! 后台维护任务：补火扫描与集群心跳
//!
//! 两个循环都独立于调度循环运行，存储失败时按重试间隔退避，不影响调度循环本身。

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_domain::JobStore;
use scheduler_worker::ListenerManager;

use crate::health::HealthReporter;

/// 还有剩余错过触发的触发器时，两轮扫描之间的最短间隔
const MIN_MISFIRE_SCAN_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Clone)]
pub(crate) struct RecoveryProcessor {
    pub store: Arc<dyn JobStore>,
    pub listeners: Arc<ListenerManager>,
    pub health: HealthReporter,
    pub halt: CancellationToken,
    pub misfire_scan_interval: Duration,
    pub checkin_interval: Duration,
    pub db_failure_retry_interval: Duration,
}

impl RecoveryProcessor {
    async fn sleep_or_halt(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.halt.cancelled() => false,
        }
    }

    /// 周期扫描错过触发的触发器并按各自的补火策略处理
    pub async fn run_misfire_handler(self) {
        info!(interval_ms = self.misfire_scan_interval.as_millis() as u64, "补火处理已启动");
        let mut failures: u32 = 0;
        loop {
            let started = Instant::now();
            let wait = match self.store.recover_misfired_triggers().await {
                Ok(result) => {
                    failures = 0;
                    if result.processed > 0 {
                        debug!(
                            earliest_new_time = ?result.earliest_new_time,
                            "补火后最早的下一次触发时间"
                        );
                    }
                    if result.has_more {
                        MIN_MISFIRE_SCAN_INTERVAL
                    } else {
                        self.misfire_scan_interval
                            .saturating_sub(started.elapsed())
                            .max(MIN_MISFIRE_SCAN_INTERVAL)
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures == 1 || failures % 4 == 0 {
                        error!(error = %e, failures, "扫描错过触发的触发器失败");
                        self.listeners
                            .notify_scheduler_error(&format!("补火扫描失败: {e}"))
                            .await;
                    }
                    self.db_failure_retry_interval
                }
            };
            if !self.sleep_or_halt(wait).await {
                break;
            }
        }
        info!("补火处理已停止");
    }

    /// 按心跳间隔写入心跳，并恢复失联实例遗留的执行
    pub async fn run_cluster_manager(self) {
        info!(interval_ms = self.checkin_interval.as_millis() as u64, "集群心跳已启动");
        let mut failures: u32 = 0;
        let mut wait = self.checkin_interval;
        loop {
            if !self.sleep_or_halt(wait).await {
                break;
            }
            let started = Instant::now();
            match self.store.check_in_and_recover().await {
                Ok(report) => {
                    if failures > 0 {
                        info!(failures, "集群心跳已恢复");
                    }
                    failures = 0;
                    self.health.report_success();
                    if !report.failed_instances.is_empty() {
                        warn!(
                            failed_instances = ?report.failed_instances,
                            recovered = report.recovered_records,
                            recovery_triggers = report.recovery_triggers_created,
                            "已接管失联实例遗留的执行"
                        );
                    } else {
                        debug!("集群心跳完成");
                    }
                    wait = self
                        .checkin_interval
                        .saturating_sub(started.elapsed())
                        .max(MIN_MISFIRE_SCAN_INTERVAL);
                }
                Err(e) => {
                    failures += 1;
                    let message = format!("集群心跳失败: {e}");
                    if failures == 1 || failures % 4 == 0 {
                        error!(error = %e, failures, "集群心跳失败");
                        self.listeners.notify_scheduler_error(&message).await;
                    }
                    self.health.report_failure(message);
                    wait = self.db_failure_retry_interval;
                }
            }
        }
        info!("集群心跳已停止");
    }
}
