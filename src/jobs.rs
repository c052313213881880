//! 内置作业类型

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::info;

use scheduler_core::JobRegistry;
use scheduler_domain::{Job, JobExecutionContext, JobExecutionError};
use scheduler_errors::SchedulerResult;

pub const LOG_JOB_TYPE: &str = "log";

/// 把数据映射中的 `message` 写入日志
pub struct LogJob;

#[async_trait]
impl Job for LogJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        let message = ctx
            .merged_data
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("作业已触发")
            .to_string();
        info!(
            job = %ctx.job.key,
            trigger = %ctx.trigger.key,
            fire_time = %ctx.fire_time,
            recovering = ctx.recovering,
            "{message}"
        );
        ctx.set_result(json!({ "logged": message }));
        Ok(())
    }
}

/// 注册全部内置作业类型
pub async fn register_builtin_jobs(registry: &JobRegistry) -> SchedulerResult<()> {
    registry.register(LOG_JOB_TYPE, Arc::new(LogJob)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use scheduler_domain::{JobDetail, JobKey, Schedule, Trigger, TriggerFiredBundle, TriggerKey};
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_log_job_records_message() {
        let job_key = JobKey::with_default_group("hello");
        let trigger = Trigger::new(TriggerKey::with_default_group("t"), job_key.clone(), Schedule::once())
            .with_data("message", "你好");
        let bundle = TriggerFiredBundle {
            job: JobDetail::new(job_key, LOG_JOB_TYPE),
            fire_time: trigger.start_time,
            scheduled_fire_time: Some(trigger.start_time),
            previous_fire_time: None,
            next_fire_time: None,
            trigger,
            calendar: None,
            recovering: false,
            fire_instance_id: "fi".into(),
        };
        let mut ctx = JobExecutionContext::new(&bundle, CancellationToken::new());
        LogJob.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.result, Some(json!({ "logged": "你好" })));
    }

    #[tokio::test]
    async fn test_builtin_registration() {
        let registry = JobRegistry::new();
        register_builtin_jobs(&registry).await.unwrap();
        assert!(registry.contains(LOG_JOB_TYPE).await);
        assert!(register_builtin_jobs(&registry).await.is_err());
    }
}
