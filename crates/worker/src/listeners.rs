//! 监听器注册与通知
//!
//! 监听器返回的错误只记录日志，不会中断正在观察的触发。

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use scheduler_domain::{
    CompletedExecutionInstruction, JobDetail, JobExecutionContext, JobExecutionError, JobKey,
    JobListener, SchedulerListener, Trigger, TriggerKey, TriggerListener,
};

#[derive(Default)]
pub struct ListenerManager {
    job_listeners: RwLock<Vec<Arc<dyn JobListener>>>,
    trigger_listeners: RwLock<Vec<Arc<dyn TriggerListener>>>,
    scheduler_listeners: RwLock<Vec<Arc<dyn SchedulerListener>>>,
}

impl ListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册作业监听器，同名监听器会被替换
    pub async fn add_job_listener(&self, listener: Arc<dyn JobListener>) {
        let mut listeners = self.job_listeners.write().await;
        listeners.retain(|l| l.name() != listener.name());
        debug!(listener = listener.name(), "注册作业监听器");
        listeners.push(listener);
    }

    pub async fn remove_job_listener(&self, name: &str) -> bool {
        let mut listeners = self.job_listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() != before
    }

    pub async fn add_trigger_listener(&self, listener: Arc<dyn TriggerListener>) {
        let mut listeners = self.trigger_listeners.write().await;
        listeners.retain(|l| l.name() != listener.name());
        debug!(listener = listener.name(), "注册触发器监听器");
        listeners.push(listener);
    }

    pub async fn remove_trigger_listener(&self, name: &str) -> bool {
        let mut listeners = self.trigger_listeners.write().await;
        let before = listeners.len();
        listeners.retain(|l| l.name() != name);
        listeners.len() != before
    }

    pub async fn add_scheduler_listener(&self, listener: Arc<dyn SchedulerListener>) {
        self.scheduler_listeners.write().await.push(listener);
    }

    pub async fn job_listener_names(&self) -> Vec<String> {
        let listeners = self.job_listeners.read().await;
        listeners.iter().map(|l| l.name().to_string()).collect()
    }

    pub async fn trigger_listener_names(&self) -> Vec<String> {
        let listeners = self.trigger_listeners.read().await;
        listeners.iter().map(|l| l.name().to_string()).collect()
    }

    async fn job_snapshot(&self) -> Vec<Arc<dyn JobListener>> {
        self.job_listeners.read().await.clone()
    }

    async fn trigger_snapshot(&self) -> Vec<Arc<dyn TriggerListener>> {
        self.trigger_listeners.read().await.clone()
    }

    async fn scheduler_snapshot(&self) -> Vec<Arc<dyn SchedulerListener>> {
        self.scheduler_listeners.read().await.clone()
    }

    // ---- 触发器监听器 ----

    /// 通知触发并询问是否否决本次执行；任一监听器否决即返回 true
    pub async fn notify_trigger_fired(&self, ctx: &JobExecutionContext) -> bool {
        let mut vetoed = false;
        for listener in self.trigger_snapshot().await {
            if let Err(e) = listener.trigger_fired(ctx).await {
                warn!(listener = listener.name(), error = %e, "触发器监听器 trigger_fired 失败");
            }
            match listener.veto_job_execution(ctx).await {
                Ok(true) => {
                    debug!(listener = listener.name(), trigger = %ctx.trigger.key, "执行被监听器否决");
                    vetoed = true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(listener = listener.name(), error = %e, "触发器监听器 veto_job_execution 失败");
                }
            }
        }
        vetoed
    }

    pub async fn notify_trigger_misfired(&self, trigger: &Trigger) {
        for listener in self.trigger_snapshot().await {
            if let Err(e) = listener.trigger_misfired(trigger).await {
                warn!(listener = listener.name(), error = %e, "触发器监听器 trigger_misfired 失败");
            }
        }
    }

    pub async fn notify_trigger_complete(
        &self,
        ctx: &JobExecutionContext,
        instruction: CompletedExecutionInstruction,
    ) {
        for listener in self.trigger_snapshot().await {
            if let Err(e) = listener.trigger_complete(ctx, instruction).await {
                warn!(listener = listener.name(), error = %e, "触发器监听器 trigger_complete 失败");
            }
        }
    }

    // ---- 作业监听器 ----

    pub async fn notify_job_to_be_executed(&self, ctx: &JobExecutionContext) {
        for listener in self.job_snapshot().await {
            if let Err(e) = listener.job_to_be_executed(ctx).await {
                warn!(listener = listener.name(), error = %e, "作业监听器 job_to_be_executed 失败");
            }
        }
    }

    pub async fn notify_job_execution_vetoed(&self, ctx: &JobExecutionContext) {
        for listener in self.job_snapshot().await {
            if let Err(e) = listener.job_execution_vetoed(ctx).await {
                warn!(listener = listener.name(), error = %e, "作业监听器 job_execution_vetoed 失败");
            }
        }
    }

    pub async fn notify_job_was_executed(
        &self,
        ctx: &JobExecutionContext,
        error: Option<&JobExecutionError>,
    ) {
        for listener in self.job_snapshot().await {
            if let Err(e) = listener.job_was_executed(ctx, error).await {
                warn!(listener = listener.name(), error = %e, "作业监听器 job_was_executed 失败");
            }
        }
    }

    // ---- 调度器监听器 ----

    pub async fn notify_job_scheduled(&self, trigger: &Trigger) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.job_scheduled(trigger).await {
                warn!(error = %e, "调度器监听器 job_scheduled 失败");
            }
        }
    }

    pub async fn notify_job_unscheduled(&self, trigger_key: &TriggerKey) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.job_unscheduled(trigger_key).await {
                warn!(error = %e, "调度器监听器 job_unscheduled 失败");
            }
        }
    }

    pub async fn notify_trigger_finalized(&self, trigger: &Trigger) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.trigger_finalized(trigger).await {
                warn!(error = %e, "调度器监听器 trigger_finalized 失败");
            }
        }
    }

    pub async fn notify_job_added(&self, job: &JobDetail) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.job_added(job).await {
                warn!(error = %e, "调度器监听器 job_added 失败");
            }
        }
    }

    pub async fn notify_job_deleted(&self, job_key: &JobKey) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.job_deleted(job_key).await {
                warn!(error = %e, "调度器监听器 job_deleted 失败");
            }
        }
    }

    pub async fn notify_scheduler_error(&self, message: &str) {
        for listener in self.scheduler_snapshot().await {
            if let Err(e) = listener.scheduler_error(message).await {
                warn!(error = %e, "调度器监听器 scheduler_error 失败");
            }
        }
    }
}

impl std::fmt::Debug for ListenerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use scheduler_domain::{Schedule, TriggerFiredBundle};
    use tokio_util::sync::CancellationToken;

    struct Vetoer {
        name: &'static str,
        veto: bool,
        fired: AtomicUsize,
    }

    #[async_trait]
    impl TriggerListener for Vetoer {
        fn name(&self) -> &str {
            self.name
        }

        async fn trigger_fired(&self, _ctx: &JobExecutionContext) -> anyhow::Result<()> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("监听器内部错误"))
        }

        async fn veto_job_execution(&self, _ctx: &JobExecutionContext) -> anyhow::Result<bool> {
            Ok(self.veto)
        }
    }

    fn context() -> JobExecutionContext {
        let job_key = JobKey::with_default_group("job");
        let trigger = Trigger::new(TriggerKey::with_default_group("t"), job_key.clone(), Schedule::once());
        let bundle = TriggerFiredBundle {
            job: JobDetail::new(job_key, "log"),
            fire_time: trigger.start_time,
            scheduled_fire_time: Some(trigger.start_time),
            previous_fire_time: None,
            next_fire_time: None,
            trigger,
            calendar: None,
            recovering: false,
            fire_instance_id: "fi".into(),
        };
        JobExecutionContext::new(&bundle, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_listener_errors_do_not_stop_notification() {
        let manager = ListenerManager::new();
        let quiet = Arc::new(Vetoer { name: "quiet", veto: false, fired: AtomicUsize::new(0) });
        let strict = Arc::new(Vetoer { name: "strict", veto: true, fired: AtomicUsize::new(0) });
        manager.add_trigger_listener(quiet.clone()).await;
        manager.add_trigger_listener(strict.clone()).await;

        assert!(manager.notify_trigger_fired(&context()).await);
        assert_eq!(quiet.fired.load(Ordering::SeqCst), 1);
        assert_eq!(strict.fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_name_replaces_listener() {
        let manager = ListenerManager::new();
        manager
            .add_trigger_listener(Arc::new(Vetoer { name: "a", veto: true, fired: AtomicUsize::new(0) }))
            .await;
        manager
            .add_trigger_listener(Arc::new(Vetoer { name: "a", veto: false, fired: AtomicUsize::new(0) }))
            .await;
        assert_eq!(manager.trigger_listener_names().await, vec!["a".to_string()]);
        assert!(!manager.notify_trigger_fired(&context()).await);

        assert!(manager.remove_trigger_listener("a").await);
        assert!(!manager.remove_trigger_listener("a").await);
    }
}
