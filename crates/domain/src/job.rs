use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::entities::{JobDetail, TriggerFiredBundle};
use crate::trigger::Trigger;
use crate::value_objects::JobDataMap;

/// 恢复触发器写入数据映射中的原始触发信息
pub const RECOVERY_ORIGINAL_TRIGGER_NAME: &str = "recovery.original_trigger_name";
pub const RECOVERY_ORIGINAL_TRIGGER_GROUP: &str = "recovery.original_trigger_group";
pub const RECOVERY_ORIGINAL_FIRE_TIME_MS: &str = "recovery.original_fire_time_ms";
pub const RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME_MS: &str =
    "recovery.original_scheduled_fire_time_ms";

/// 作业逻辑抛出的失败，附带希望调度器如何处理触发器
#[derive(Debug, Clone, Error, Default)]
#[error("作业执行失败: {message}")]
pub struct JobExecutionError {
    pub message: String,
    pub refire_immediately: bool,
    pub unschedule_firing_trigger: bool,
    pub unschedule_all_triggers: bool,
}

impl JobExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// 请求立即重新执行
    pub fn refire(message: impl Into<String>) -> Self {
        Self {
            refire_immediately: true,
            ..Self::new(message)
        }
    }

    /// 请求取消本次触发的触发器
    pub fn unschedule_firing_trigger(message: impl Into<String>) -> Self {
        Self {
            unschedule_firing_trigger: true,
            ..Self::new(message)
        }
    }

    /// 请求取消该作业的所有触发器
    pub fn unschedule_all_triggers(message: impl Into<String>) -> Self {
        Self {
            unschedule_all_triggers: true,
            ..Self::new(message)
        }
    }
}

impl From<anyhow::Error> for JobExecutionError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string())
    }
}

/// 执行上下文：作业数据、触发信息、结果槽以及中断信号
#[derive(Debug, Clone)]
pub struct JobExecutionContext {
    pub job: JobDetail,
    pub trigger: Trigger,
    /// 作业数据与触发器数据合并后的映射，触发器数据优先
    pub merged_data: JobDataMap,
    pub fire_instance_id: String,
    pub fire_time: DateTime<Utc>,
    pub scheduled_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub recovering: bool,
    pub refire_count: u32,
    pub result: Option<serde_json::Value>,
    cancellation: CancellationToken,
}

impl JobExecutionContext {
    pub fn new(bundle: &TriggerFiredBundle, cancellation: CancellationToken) -> Self {
        let mut merged_data = bundle.job.job_data.clone();
        for (key, value) in &bundle.trigger.job_data {
            merged_data.insert(key.clone(), value.clone());
        }
        Self {
            job: bundle.job.clone(),
            trigger: bundle.trigger.clone(),
            merged_data,
            fire_instance_id: bundle.fire_instance_id.clone(),
            fire_time: bundle.fire_time,
            scheduled_fire_time: bundle.scheduled_fire_time,
            previous_fire_time: bundle.previous_fire_time,
            next_fire_time: bundle.next_fire_time,
            recovering: bundle.recovering,
            refire_count: 0,
            result: None,
            cancellation,
        }
    }

    pub fn job_data(&self) -> &JobDataMap {
        &self.job.job_data
    }

    pub fn trigger_data(&self) -> &JobDataMap {
        &self.trigger.job_data
    }

    /// 执行中可修改的作业数据；作业设置了 persist_job_data_after_execution 时会被写回
    pub fn job_data_mut(&mut self) -> &mut JobDataMap {
        &mut self.job.job_data
    }

    pub fn set_result(&mut self, result: impl Into<serde_json::Value>) {
        self.result = Some(result.into());
    }

    pub fn is_interrupted(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 等待中断信号，作业可以在 select 中使用
    pub async fn interrupted(&self) {
        self.cancellation.cancelled().await
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// 可执行的作业逻辑
#[async_trait]
pub trait Job: Send + Sync {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
}
