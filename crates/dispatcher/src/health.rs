use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use scheduler_domain::now_millis;

/// 调度器健康状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SchedulerHealth {
    Healthy,
    /// 存储访问持续失败，调度循环在按间隔重试
    Degraded { reason: String, since: DateTime<Utc> },
}

impl SchedulerHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, SchedulerHealth::Healthy)
    }
}

#[derive(Clone)]
pub struct HealthReporter {
    tx: Arc<watch::Sender<SchedulerHealth>>,
}

impl HealthReporter {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SchedulerHealth::Healthy);
        Self { tx: Arc::new(tx) }
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerHealth> {
        self.tx.subscribe()
    }

    pub fn current(&self) -> SchedulerHealth {
        self.tx.borrow().clone()
    }

    /// 记录一次失败；首次降级时记录开始时间，之后只更新原因
    pub fn report_failure(&self, reason: impl Into<String>) {
        let reason = reason.into();
        self.tx.send_modify(|health| match health {
            SchedulerHealth::Healthy => {
                warn!(reason = %reason, "调度器进入降级状态");
                *health = SchedulerHealth::Degraded { reason, since: now_millis() };
            }
            SchedulerHealth::Degraded { reason: current, .. } => {
                *current = reason;
            }
        });
    }

    pub fn report_success(&self) {
        self.tx.send_if_modified(|health| {
            if health.is_healthy() {
                return false;
            }
            info!("存储访问已恢复，调度器恢复健康");
            *health = SchedulerHealth::Healthy;
            true
        });
    }
}

impl Default for HealthReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HealthReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthReporter")
            .field("current", &self.current())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_keeps_first_timestamp() {
        let reporter = HealthReporter::new();
        let rx = reporter.subscribe();
        assert!(rx.borrow().is_healthy());

        reporter.report_failure("连接失败");
        let first_since = match reporter.current() {
            SchedulerHealth::Degraded { since, .. } => since,
            SchedulerHealth::Healthy => panic!("应为降级状态"),
        };
        reporter.report_failure("仍然失败");
        match reporter.current() {
            SchedulerHealth::Degraded { reason, since } => {
                assert_eq!(reason, "仍然失败");
                assert_eq!(since, first_since);
            }
            SchedulerHealth::Healthy => panic!("应为降级状态"),
        }

        reporter.report_success();
        assert!(rx.borrow().is_healthy());
    }
}
