//! 调度变更信号
//!
//! 存储层和管理接口在调度数据变化时发出信号，调度循环据此提前醒来，
//! 必要时放弃已获取但触发时间更晚的触发器。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Notify;
use tracing::{debug, warn};

use scheduler_domain::{SchedulerSignaler, Trigger};
use scheduler_worker::ListenerManager;

/// 距离触发不足该时长时，不再为更早的候选时间放弃已获取的触发器
const MIN_SWITCH_AHEAD_MS: i64 = 70;

#[derive(Debug, Default)]
pub struct SchedulingSignal {
    /// None 表示没有信号；Some(None) 表示变化但没有候选时间
    pending: Mutex<Option<Option<DateTime<Utc>>>>,
    notify: Notify,
}

impl SchedulingSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self, candidate: Option<DateTime<Utc>>) {
        match self.pending.lock() {
            Ok(mut pending) => {
                // 保留更早的候选时间；未知时间优先
                let merged = match (*pending, candidate) {
                    (Some(None), _) | (_, None) => None,
                    (Some(Some(old)), Some(new)) => Some(old.min(new)),
                    (None, Some(new)) => Some(new),
                };
                *pending = Some(merged);
            }
            Err(e) => warn!(error = %e, "调度信号锁已损坏"),
        }
        self.notify.notify_one();
    }

    pub fn clear(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = None;
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.pending.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    /// 取出信号并判断是否值得放弃触发时间为 `old_time` 的已获取触发器
    pub fn take_if_earlier(&self, old_time: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        let Some(candidate) = pending.take() else {
            return false;
        };
        let earlier = match candidate {
            None => true,
            Some(candidate) => candidate < old_time,
        };
        earlier && old_time - now >= Duration::milliseconds(MIN_SWITCH_AHEAD_MS)
    }

    pub async fn notified(&self) {
        self.notify.notified().await
    }
}

/// 存储层事件的接收方：转发给监听器，并唤醒调度循环
pub struct SchedulerSignalerImpl {
    listeners: Arc<ListenerManager>,
    signal: Arc<SchedulingSignal>,
}

impl SchedulerSignalerImpl {
    pub fn new(listeners: Arc<ListenerManager>, signal: Arc<SchedulingSignal>) -> Self {
        Self { listeners, signal }
    }
}

#[async_trait]
impl SchedulerSignaler for SchedulerSignalerImpl {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_misfired(trigger).await;
    }

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger) {
        self.listeners.notify_trigger_finalized(trigger).await;
    }

    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>) {
        debug!(candidate = ?candidate_new_next_fire_time, "调度数据已变化");
        self.signal.signal(candidate_new_next_fire_time);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::now_millis;

    #[test]
    fn test_earlier_candidate_wins_when_far_enough() {
        let signal = SchedulingSignal::new();
        let now = now_millis();
        let old_time = now + Duration::seconds(10);

        assert!(!signal.take_if_earlier(old_time, now));

        signal.signal(Some(now + Duration::seconds(5)));
        assert!(signal.take_if_earlier(old_time, now));
        assert!(!signal.is_signaled());

        signal.signal(Some(now + Duration::seconds(20)));
        assert!(!signal.take_if_earlier(old_time, now));

        signal.signal(None);
        assert!(signal.take_if_earlier(old_time, now));
    }

    #[test]
    fn test_too_close_to_fire_time_keeps_acquired() {
        let signal = SchedulingSignal::new();
        let now = now_millis();
        signal.signal(None);
        assert!(!signal.take_if_earlier(now + Duration::milliseconds(20), now));
    }

    #[test]
    fn test_signals_merge_to_earliest() {
        let signal = SchedulingSignal::new();
        let now = now_millis();
        signal.signal(Some(now + Duration::seconds(8)));
        signal.signal(Some(now + Duration::seconds(3)));
        assert!(signal.take_if_earlier(now + Duration::seconds(5), now));

        signal.signal(Some(now + Duration::seconds(8)));
        signal.signal(Some(now + Duration::seconds(9)));
        assert!(!signal.take_if_earlier(now + Duration::seconds(5), now));
    }

    #[tokio::test]
    async fn test_signal_before_wait_is_not_lost() {
        let signal = SchedulingSignal::new();
        signal.signal(None);
        tokio::time::timeout(std::time::Duration::from_secs(1), signal.notified())
            .await
            .unwrap();
    }
}
