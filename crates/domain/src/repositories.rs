//! 作业存储抽象
//!
//! 调度器只通过该接口访问持久化数据；每个操作在一个事务边界内完成，
//! 失败时整体回滚。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::calendar::Calendar;
use crate::entities::{
    FiredTriggerRecord, JobDetail, MisfireScanResult, RecoveryReport, SchedulerStateRecord,
    TriggerFiredResult, TriggerState,
};
use crate::instruction::CompletedExecutionInstruction;
use crate::listeners::SchedulerSignaler;
use crate::trigger::Trigger;
use crate::value_objects::{JobKey, TriggerKey};
use scheduler_errors::SchedulerResult;

#[async_trait]
pub trait JobStore: Send + Sync {
    // ---- 生命周期 ----

    /// 注入事件回报通道并准备存储（建表等）
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()>;

    /// 调度器启动：非集群模式下恢复上次运行遗留的状态，集群模式下完成首次心跳
    async fn scheduler_started(&self) -> SchedulerResult<()>;

    /// 调度器关闭；`retire_instance` 为 true 时删除本实例的心跳记录
    async fn shutdown(&self, retire_instance: bool) -> SchedulerResult<()>;

    fn is_clustered(&self) -> bool;

    fn instance_id(&self) -> &str;

    fn misfire_threshold(&self) -> Duration;

    // ---- 作业与触发器 ----

    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger)
        -> SchedulerResult<()>;

    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()>;

    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool)
        -> SchedulerResult<()>;

    /// 删除作业及其全部触发器，返回作业是否存在
    async fn remove_job(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    /// 删除触发器；非持久作业失去最后一个触发器时一并删除
    async fn remove_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool>;

    /// 用新触发器替换旧触发器（必须属于同一作业）
    async fn replace_trigger(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool>;

    async fn retrieve_job(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>>;

    async fn retrieve_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>>;

    async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool>;

    async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool>;

    async fn get_trigger_state(&self, trigger_key: &TriggerKey)
        -> SchedulerResult<Option<TriggerState>>;

    async fn get_triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>>;

    async fn get_job_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<JobKey>>;

    async fn get_trigger_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<TriggerKey>>;

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>>;

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>>;

    async fn get_number_of_jobs(&self) -> SchedulerResult<usize>;

    async fn get_number_of_triggers(&self) -> SchedulerResult<usize>;

    /// 清空全部作业、触发器和日历
    async fn clear_all_scheduling_data(&self) -> SchedulerResult<()>;

    // ---- 日历 ----

    /// 存储日历；`update_triggers` 为 true 时重新计算引用它的触发器
    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()>;

    /// 删除日历；仍被触发器引用时失败
    async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool>;

    async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>>;

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>>;

    // ---- 暂停与恢复 ----

    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()>;

    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()>;

    async fn pause_trigger_group(&self, group: &str) -> SchedulerResult<()>;

    async fn resume_trigger_group(&self, group: &str) -> SchedulerResult<()>;

    async fn pause_job_group(&self, group: &str) -> SchedulerResult<()>;

    async fn resume_job_group(&self, group: &str) -> SchedulerResult<()>;

    async fn pause_all(&self) -> SchedulerResult<()>;

    async fn resume_all(&self) -> SchedulerResult<()>;

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<HashSet<String>>;

    // ---- 触发 ----

    /// 获取不晚于 `no_later_than + time_window` 的待触发触发器，转为 ACQUIRED 并写入已触发记录
    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>>;

    /// 把已获取但不再执行的触发器放回 WAITING
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()>;

    /// 确认触发并转为 EXECUTING；竞争失败的触发器不出现在结果中
    async fn triggers_fired(&self, triggers: &[Trigger])
        -> SchedulerResult<Vec<TriggerFiredResult>>;

    /// 执行结束后应用完成指令；已触发记录不存在时为空操作并返回 false
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<bool>;

    // ---- 补火与恢复 ----

    async fn recover_misfired_triggers(&self) -> SchedulerResult<MisfireScanResult>;

    /// 写入心跳并恢复失联实例遗留的执行（仅集群模式）
    async fn check_in_and_recover(&self) -> SchedulerResult<RecoveryReport>;

    // ---- 查询 ----

    async fn get_fired_trigger_records(&self) -> SchedulerResult<Vec<FiredTriggerRecord>>;

    async fn get_scheduler_instances(&self) -> SchedulerResult<Vec<SchedulerStateRecord>>;
}
