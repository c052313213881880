use chrono::{DateTime, Utc};

use scheduler_domain::{SchedulerSignaler, Trigger};

/// 事务中收集、提交后才发出的事件
///
/// 回滚的操作不会产生任何通知。
#[derive(Debug, Default)]
pub(crate) struct PendingEvents {
    misfired: Vec<Trigger>,
    finalized: Vec<Trigger>,
    scheduling_change: Option<Option<DateTime<Utc>>>,
}

impl PendingEvents {
    pub fn misfired(&mut self, trigger: Trigger) {
        self.misfired.push(trigger);
    }

    pub fn finalized(&mut self, trigger: Trigger) {
        self.finalized.push(trigger);
    }

    /// 多次调用时保留最早的候选时间；任何一次给出 None 都表示"未知，需要重新检查"
    pub fn scheduling_change(&mut self, candidate: Option<DateTime<Utc>>) {
        self.scheduling_change = Some(match (self.scheduling_change, candidate) {
            (None, c) => c,
            (Some(None), _) | (Some(_), None) => None,
            (Some(Some(a)), Some(b)) => Some(a.min(b)),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.misfired.is_empty() && self.finalized.is_empty() && self.scheduling_change.is_none()
    }

    pub async fn dispatch(self, signaler: &dyn SchedulerSignaler) {
        for trigger in &self.misfired {
            signaler.notify_trigger_listeners_misfired(trigger).await;
        }
        for trigger in &self.finalized {
            signaler.notify_scheduler_listeners_finalized(trigger).await;
        }
        if let Some(candidate) = self.scheduling_change {
            signaler.signal_scheduling_change(candidate);
        }
    }
}
