use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::instruction::CompletedExecutionInstruction;
use crate::job::{JobExecutionContext, JobExecutionError};
use crate::trigger::Trigger;
use crate::value_objects::{JobKey, TriggerKey};
use crate::entities::JobDetail;

/// 作业执行事件监听器；返回的错误只会被记录，不影响本次触发
#[async_trait]
pub trait JobListener: Send + Sync {
    fn name(&self) -> &str;

    async fn job_to_be_executed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn job_execution_vetoed(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn job_was_executed(
        &self,
        _ctx: &JobExecutionContext,
        _error: Option<&JobExecutionError>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 触发器事件监听器
#[async_trait]
pub trait TriggerListener: Send + Sync {
    fn name(&self) -> &str;

    async fn trigger_fired(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// 返回 true 时否决本次执行
    async fn veto_job_execution(&self, _ctx: &JobExecutionContext) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn trigger_misfired(&self, _trigger: &Trigger) -> anyhow::Result<()> {
        Ok(())
    }

    async fn trigger_complete(
        &self,
        _ctx: &JobExecutionContext,
        _instruction: CompletedExecutionInstruction,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 调度器级别事件监听器
#[async_trait]
pub trait SchedulerListener: Send + Sync {
    async fn job_scheduled(&self, _trigger: &Trigger) -> anyhow::Result<()> {
        Ok(())
    }

    async fn job_unscheduled(&self, _trigger_key: &TriggerKey) -> anyhow::Result<()> {
        Ok(())
    }

    /// 触发器不会再触发（已完成或被删除）
    async fn trigger_finalized(&self, _trigger: &Trigger) -> anyhow::Result<()> {
        Ok(())
    }

    async fn job_added(&self, _job: &JobDetail) -> anyhow::Result<()> {
        Ok(())
    }

    async fn job_deleted(&self, _job_key: &JobKey) -> anyhow::Result<()> {
        Ok(())
    }

    async fn scheduler_error(&self, _message: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 存储层向调度器回报事件的通道
#[async_trait]
pub trait SchedulerSignaler: Send + Sync {
    async fn notify_trigger_listeners_misfired(&self, trigger: &Trigger);

    async fn notify_scheduler_listeners_finalized(&self, trigger: &Trigger);

    /// 调度数据发生变化，`candidate_new_next_fire_time` 为可能更早的触发时间
    fn signal_scheduling_change(&self, candidate_new_next_fire_time: Option<DateTime<Utc>>);
}

/// 不做任何事情的信号器，用于未初始化或测试的存储
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSignaler;

#[async_trait]
impl SchedulerSignaler for NoopSignaler {
    async fn notify_trigger_listeners_misfired(&self, _trigger: &Trigger) {}

    async fn notify_scheduler_listeners_finalized(&self, _trigger: &Trigger) {}

    fn signal_scheduling_change(&self, _candidate_new_next_fire_time: Option<DateTime<Utc>>) {}
}
