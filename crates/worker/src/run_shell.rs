//! 作业执行外壳
//!
//! 负责一次触发的完整执行过程：查找作业实现、通知监听器、处理否决、超时与 panic，
//! 按作业的执行结果决定完成指令。要求立即重新执行时在外壳内部循环，不回到存储层。

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{JobRegistry, SchedulerMetrics};
use scheduler_domain::{
    CompletedExecutionInstruction, Job, JobDetail, JobExecutionContext, JobExecutionError,
    Trigger, TriggerFiredBundle,
};

use crate::listeners::ListenerManager;

/// 一次执行的结果，由执行池发回调度循环，再由调度循环写回存储
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub fire_instance_id: String,
    /// 已推进过的触发器
    pub trigger: Trigger,
    /// 执行后的作业定义，作业数据可能被修改
    pub job: JobDetail,
    pub instruction: CompletedExecutionInstruction,
    pub error: Option<JobExecutionError>,
    pub vetoed: bool,
    pub refire_count: u32,
    pub duration: Duration,
}

impl JobCompletion {
    pub fn succeeded(&self) -> bool {
        self.error.is_none() && !self.vetoed
    }
}

pub struct JobRunShell {
    bundle: TriggerFiredBundle,
    registry: JobRegistry,
    listeners: Arc<ListenerManager>,
    metrics: SchedulerMetrics,
    timeout: Option<Duration>,
    cancellation: CancellationToken,
}

impl JobRunShell {
    pub fn new(
        bundle: TriggerFiredBundle,
        registry: JobRegistry,
        listeners: Arc<ListenerManager>,
        metrics: SchedulerMetrics,
    ) -> Self {
        Self {
            bundle,
            registry,
            listeners,
            metrics,
            timeout: None,
            cancellation: CancellationToken::new(),
        }
    }

    /// 单次执行的超时，超时后发出中断信号并按失败处理
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn bundle(&self) -> &TriggerFiredBundle {
        &self.bundle
    }

    pub fn fire_instance_id(&self) -> &str {
        &self.bundle.fire_instance_id
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    pub async fn run(self) -> JobCompletion {
        let started = Instant::now();
        let job_type = self.bundle.job.job_type.clone();

        let Some(job) = self.registry.get(&job_type).await else {
            error!(
                job = %self.bundle.job.key,
                job_type = %job_type,
                "作业类型未注册，作业的全部触发器标记为 ERROR"
            );
            let error = JobExecutionError::new(format!("未注册的作业类型: {job_type}"));
            self.listeners
                .notify_scheduler_error(&error.message)
                .await;
            self.metrics.record_job_executed(&job_type, false, started.elapsed());
            return JobCompletion {
                fire_instance_id: self.bundle.fire_instance_id.clone(),
                trigger: self.bundle.trigger.clone(),
                job: self.bundle.job.clone(),
                instruction: CompletedExecutionInstruction::SetAllJobTriggersError,
                error: Some(error),
                vetoed: false,
                refire_count: 0,
                duration: started.elapsed(),
            };
        };

        let mut ctx = JobExecutionContext::new(&self.bundle, self.cancellation.clone());

        if self.listeners.notify_trigger_fired(&ctx).await {
            self.listeners.notify_job_execution_vetoed(&ctx).await;
            let instruction = ctx.trigger.execution_complete(None);
            info!(
                trigger = %ctx.trigger.key,
                job = %ctx.job.key,
                instruction = %instruction,
                "执行被否决"
            );
            return self.completion(ctx, instruction, None, true, started);
        }

        loop {
            self.listeners.notify_job_to_be_executed(&ctx).await;
            debug!(
                job = %ctx.job.key,
                trigger = %ctx.trigger.key,
                fire_instance_id = %ctx.fire_instance_id,
                refire_count = ctx.refire_count,
                "开始执行作业"
            );

            let error = self.execute_once(job.as_ref(), &mut ctx).await.err();
            if let Some(e) = &error {
                warn!(job = %ctx.job.key, error = %e, "作业执行失败");
            }
            self.listeners
                .notify_job_was_executed(&ctx, error.as_ref())
                .await;

            let instruction = ctx.trigger.execution_complete(error.as_ref());
            self.listeners.notify_trigger_complete(&ctx, instruction).await;

            if instruction == CompletedExecutionInstruction::ReExecuteJob {
                if self.cancellation.is_cancelled() {
                    info!(job = %ctx.job.key, "作业已被中断，不再重新执行");
                    return self.completion(
                        ctx,
                        CompletedExecutionInstruction::Noop,
                        error,
                        false,
                        started,
                    );
                }
                ctx.refire_count += 1;
                debug!(job = %ctx.job.key, refire_count = ctx.refire_count, "作业要求立即重新执行");
                tokio::task::yield_now().await;
                continue;
            }

            self.metrics
                .record_job_executed(&job_type, error.is_none(), started.elapsed());
            return self.completion(ctx, instruction, error, false, started);
        }
    }

    async fn execute_once(
        &self,
        job: &dyn Job,
        ctx: &mut JobExecutionContext,
    ) -> Result<(), JobExecutionError> {
        let execution = AssertUnwindSafe(job.execute(ctx)).catch_unwind();
        let outcome = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.cancellation.cancel();
                    return Err(JobExecutionError::new(format!(
                        "作业执行超过 {} 毫秒",
                        limit.as_millis()
                    )));
                }
            },
            None => execution.await,
        };
        outcome.unwrap_or_else(|_| Err(JobExecutionError::new("作业执行时发生 panic")))
    }

    fn completion(
        &self,
        ctx: JobExecutionContext,
        instruction: CompletedExecutionInstruction,
        error: Option<JobExecutionError>,
        vetoed: bool,
        started: Instant,
    ) -> JobCompletion {
        JobCompletion {
            fire_instance_id: ctx.fire_instance_id,
            trigger: ctx.trigger,
            job: ctx.job,
            instruction,
            error,
            vetoed,
            refire_count: ctx.refire_count,
            duration: started.elapsed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mockall::mock;
    use scheduler_domain::{now_millis, JobKey, Schedule, TriggerKey, REPEAT_INDEFINITELY};

    mock! {
        pub TestJob {}

        #[async_trait]
        impl Job for TestJob {
            async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError>;
        }
    }

    fn bundle(schedule: Schedule) -> TriggerFiredBundle {
        let job_key = JobKey::with_default_group("job");
        let mut trigger = Trigger::new(TriggerKey::with_default_group("t"), job_key.clone(), schedule)
            .with_start_time(now_millis());
        trigger.compute_first_fire_time(None);
        let fire_time = trigger.next_fire_time.unwrap_or_else(now_millis);
        trigger.triggered(None);
        TriggerFiredBundle {
            job: JobDetail::new(job_key, "test").with_data("count", 0),
            previous_fire_time: trigger.previous_fire_time,
            next_fire_time: trigger.next_fire_time,
            trigger,
            calendar: None,
            recovering: false,
            fire_time,
            scheduled_fire_time: Some(fire_time),
            fire_instance_id: "fi-1".into(),
        }
    }

    async fn shell_with(job: MockTestJob, schedule: Schedule) -> JobRunShell {
        let registry = JobRegistry::new();
        registry.register("test", Arc::new(job)).await.unwrap();
        JobRunShell::new(
            bundle(schedule),
            registry,
            Arc::new(ListenerManager::new()),
            SchedulerMetrics::new(),
        )
    }

    #[tokio::test]
    async fn test_successful_one_shot_deletes_trigger() {
        let mut job = MockTestJob::new();
        job.expect_execute().times(1).returning(|ctx| {
            ctx.job_data_mut().insert("count".into(), 1.into());
            Ok(())
        });
        let completion = shell_with(job, Schedule::once()).await.run().await;

        assert!(completion.succeeded());
        assert_eq!(completion.instruction, CompletedExecutionInstruction::DeleteTrigger);
        assert_eq!(completion.job.job_data["count"], 1);
    }

    #[tokio::test]
    async fn test_repeating_trigger_continues() {
        let mut job = MockTestJob::new();
        job.expect_execute().times(1).returning(|_| Ok(()));
        let completion = shell_with(job, Schedule::simple(1_000, REPEAT_INDEFINITELY))
            .await
            .run()
            .await;
        assert_eq!(completion.instruction, CompletedExecutionInstruction::Noop);
    }

    #[tokio::test]
    async fn test_refire_request_executes_again_in_place() {
        let mut job = MockTestJob::new();
        let mut calls = 0;
        job.expect_execute().times(3).returning(move |_| {
            calls += 1;
            if calls < 3 {
                Err(JobExecutionError::refire("稍后重试"))
            } else {
                Ok(())
            }
        });
        let completion = shell_with(job, Schedule::simple(1_000, REPEAT_INDEFINITELY))
            .await
            .run()
            .await;
        assert_eq!(completion.refire_count, 2);
        assert!(completion.succeeded());
    }

    #[tokio::test]
    async fn test_unschedule_requests_map_to_instructions() {
        let mut job = MockTestJob::new();
        job.expect_execute()
            .returning(|_| Err(JobExecutionError::unschedule_all_triggers("停止")));
        let completion = shell_with(job, Schedule::simple(1_000, REPEAT_INDEFINITELY))
            .await
            .run()
            .await;
        assert_eq!(
            completion.instruction,
            CompletedExecutionInstruction::SetAllJobTriggersComplete
        );
        assert!(!completion.succeeded());
    }

    #[tokio::test]
    async fn test_unknown_job_type_marks_triggers_error() {
        let shell = JobRunShell::new(
            bundle(Schedule::once()),
            JobRegistry::new(),
            Arc::new(ListenerManager::new()),
            SchedulerMetrics::new(),
        );
        let completion = shell.run().await;
        assert_eq!(
            completion.instruction,
            CompletedExecutionInstruction::SetAllJobTriggersError
        );
    }

    struct SlowJob;

    #[async_trait]
    impl Job for SlowJob {
        async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            tokio::select! {
                _ = ctx.interrupted() => Err(JobExecutionError::new("被中断")),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn test_timeout_fails_execution_and_signals_interrupt() {
        let registry = JobRegistry::new();
        registry.register("test", Arc::new(SlowJob)).await.unwrap();
        let shell = JobRunShell::new(
            bundle(Schedule::simple(1_000, REPEAT_INDEFINITELY)),
            registry,
            Arc::new(ListenerManager::new()),
            SchedulerMetrics::new(),
        )
        .with_timeout(Some(Duration::from_millis(50)));
        let token = shell.cancellation_token();

        let completion = shell.run().await;
        assert!(completion.error.is_some());
        assert!(token.is_cancelled());
        assert_eq!(completion.instruction, CompletedExecutionInstruction::Noop);
    }

    struct PanickingJob;

    #[async_trait]
    impl Job for PanickingJob {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            panic!("boom")
        }
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let registry = JobRegistry::new();
        registry.register("test", Arc::new(PanickingJob)).await.unwrap();
        let shell = JobRunShell::new(
            bundle(Schedule::once()),
            registry,
            Arc::new(ListenerManager::new()),
            SchedulerMetrics::new(),
        );
        let completion = shell.run().await;
        assert!(completion.error.is_some());
        assert_eq!(completion.instruction, CompletedExecutionInstruction::DeleteTrigger);
    }
}
