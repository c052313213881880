use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::trigger::Trigger;
use crate::value_objects::{JobDataMap, JobKey, TriggerKey, RECOVERING_JOBS_GROUP};
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 作业定义：标识、要执行的逻辑（按类型名称在注册表中查找）、数据以及行为标志
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDetail {
    pub key: JobKey,
    /// 作业类型名称，对应 JobRegistry 中注册的实现
    pub job_type: String,
    pub description: Option<String>,
    #[serde(default)]
    pub job_data: JobDataMap,
    /// 没有任何触发器时是否仍然保留
    #[serde(default)]
    pub durable: bool,
    #[serde(default)]
    pub concurrent_execution_disallowed: bool,
    /// 执行结束后是否把上下文中的数据写回作业
    #[serde(default)]
    pub persist_job_data_after_execution: bool,
    /// 所在实例崩溃后是否由其他实例重新执行
    #[serde(default)]
    pub requests_recovery: bool,
}

impl JobDetail {
    pub fn new(key: JobKey, job_type: impl Into<String>) -> Self {
        Self {
            key,
            job_type: job_type.into(),
            description: None,
            job_data: JobDataMap::new(),
            durable: false,
            concurrent_execution_disallowed: false,
            persist_job_data_after_execution: false,
            requests_recovery: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.job_data.insert(key.into(), value.into());
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_concurrent_execution_disallowed(mut self, disallowed: bool) -> Self {
        self.concurrent_execution_disallowed = disallowed;
        self
    }

    pub fn with_persist_job_data_after_execution(mut self, persist: bool) -> Self {
        self.persist_job_data_after_execution = persist;
        self
    }

    pub fn with_requests_recovery(mut self, requests_recovery: bool) -> Self {
        self.requests_recovery = requests_recovery;
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.key.name.trim().is_empty() || self.key.group.trim().is_empty() {
            return Err(SchedulerError::validation_error("作业名称和分组不能为空"));
        }
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "作业 {} 未指定作业类型",
                self.key
            )));
        }
        Ok(())
    }
}

/// 触发器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerState {
    #[default]
    Waiting,
    Acquired,
    Executing,
    Complete,
    Paused,
    Blocked,
    PausedBlocked,
    Error,
}

impl TriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerState::Waiting => "WAITING",
            TriggerState::Acquired => "ACQUIRED",
            TriggerState::Executing => "EXECUTING",
            TriggerState::Complete => "COMPLETE",
            TriggerState::Paused => "PAUSED",
            TriggerState::Blocked => "BLOCKED",
            TriggerState::PausedBlocked => "PAUSED_BLOCKED",
            TriggerState::Error => "ERROR",
        }
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, TriggerState::Paused | TriggerState::PausedBlocked)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TriggerState::Complete | TriggerState::Error)
    }
}

impl fmt::Display for TriggerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WAITING" => Ok(TriggerState::Waiting),
            "ACQUIRED" => Ok(TriggerState::Acquired),
            "EXECUTING" => Ok(TriggerState::Executing),
            "COMPLETE" => Ok(TriggerState::Complete),
            "PAUSED" => Ok(TriggerState::Paused),
            "BLOCKED" => Ok(TriggerState::Blocked),
            "PAUSED_BLOCKED" => Ok(TriggerState::PausedBlocked),
            "ERROR" => Ok(TriggerState::Error),
            other => Err(SchedulerError::Serialization(format!(
                "未知的触发器状态: {other}"
            ))),
        }
    }
}

/// 已触发记录的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FiredTriggerState {
    Acquired,
    Executing,
}

impl FiredTriggerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FiredTriggerState::Acquired => "ACQUIRED",
            FiredTriggerState::Executing => "EXECUTING",
        }
    }
}

impl FromStr for FiredTriggerState {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ACQUIRED" => Ok(FiredTriggerState::Acquired),
            "EXECUTING" => Ok(FiredTriggerState::Executing),
            other => Err(SchedulerError::Serialization(format!(
                "未知的已触发记录状态: {other}"
            ))),
        }
    }
}

/// 一次进行中的执行：获取时创建，完成时删除，用于崩溃检测
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiredTriggerRecord {
    pub fire_instance_id: String,
    pub trigger_key: TriggerKey,
    pub job_key: JobKey,
    /// 持有该记录的调度器实例
    pub instance_id: String,
    pub fired_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub priority: i32,
    pub state: FiredTriggerState,
    pub concurrent_execution_disallowed: bool,
    pub requests_recovery: bool,
}

/// 调度器实例的心跳记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStateRecord {
    pub instance_id: String,
    pub last_checkin_time: DateTime<Utc>,
    pub checkin_interval_ms: i64,
}

impl SchedulerStateRecord {
    /// 判断实例是否已失联：
    /// 心跳间隔取记录间隔与本实例距上次心跳时长中的较大者，再加上固定宽限期
    pub fn has_failed(
        &self,
        now: DateTime<Utc>,
        own_last_checkin: Option<DateTime<Utc>>,
        grace_ms: i64,
    ) -> bool {
        let since_own = own_last_checkin
            .map(|t| (now - t).num_milliseconds())
            .unwrap_or(0);
        let tolerance = self.checkin_interval_ms.max(since_own) + grace_ms;
        self.last_checkin_time.timestamp_millis() + tolerance < now.timestamp_millis()
    }
}

/// triggers_fired 返回的执行包：作业、触发器及日历快照
#[derive(Debug, Clone)]
pub struct TriggerFiredBundle {
    pub job: JobDetail,
    /// 已经推进过（triggered）的触发器
    pub trigger: Trigger,
    pub calendar: Option<Calendar>,
    pub recovering: bool,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub fire_instance_id: String,
}

impl TriggerFiredBundle {
    pub fn is_recovery_trigger(trigger_key: &TriggerKey) -> bool {
        trigger_key.group == RECOVERING_JOBS_GROUP
    }
}

/// 单个触发器的 triggers_fired 结果；竞争失败的触发器不会出现在结果中
#[derive(Debug)]
pub enum TriggerFiredResult {
    Fired(Box<TriggerFiredBundle>),
    Failed {
        trigger: Box<Trigger>,
        error: SchedulerError,
    },
}

/// 一次补火扫描的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MisfireScanResult {
    pub processed: usize,
    /// 达到单次处理上限，还有剩余
    pub has_more: bool,
    /// 处理后最早的下一次触发时间，用于唤醒调度循环
    pub earliest_new_time: Option<DateTime<Utc>>,
}

/// 一次集群心跳（及可能的恢复）的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub failed_instances: Vec<String>,
    pub recovered_records: usize,
    pub recovery_triggers_created: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_trigger_state_string_mapping() {
        for state in [
            TriggerState::Waiting,
            TriggerState::Acquired,
            TriggerState::Executing,
            TriggerState::Complete,
            TriggerState::Paused,
            TriggerState::Blocked,
            TriggerState::PausedBlocked,
            TriggerState::Error,
        ] {
            assert_eq!(state.as_str().parse::<TriggerState>().unwrap(), state);
        }
        assert!("NOPE".parse::<TriggerState>().is_err());
        assert!(TriggerState::PausedBlocked.is_paused());
        assert!(TriggerState::Error.is_terminal());
    }

    #[test]
    fn test_scheduler_state_failure_detection() {
        let now = Utc::now();
        let record = SchedulerStateRecord {
            instance_id: "node-a".into(),
            last_checkin_time: now - Duration::seconds(20),
            checkin_interval_ms: 7_500,
        };
        assert!(record.has_failed(now, Some(now - Duration::seconds(1)), 7_500));
        // 本实例自己也很久没有心跳（例如GC停顿），放宽判断
        assert!(!record.has_failed(now, Some(now - Duration::seconds(30)), 7_500));

        let fresh = SchedulerStateRecord {
            last_checkin_time: now - Duration::seconds(5),
            ..record
        };
        assert!(!fresh.has_failed(now, None, 7_500));
    }

    #[test]
    fn test_job_detail_validation() {
        let job = JobDetail::new(JobKey::with_default_group("j1"), "log");
        assert!(job.validate().is_ok());
        let bad = JobDetail::new(JobKey::with_default_group(""), "log");
        assert!(bad.validate().is_err());
        let no_type = JobDetail::new(JobKey::with_default_group("j1"), " ");
        assert!(no_type.validate().is_err());
    }
}
