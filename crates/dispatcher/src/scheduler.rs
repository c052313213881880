//! 调度器门面
//!
//! 持有存储、执行池和后台任务，对外提供作业与触发器的管理接口以及生命周期控制。
//! 一个 `Scheduler` 对应集群中的一个实例。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{AppConfig, JobRegistry, SchedulerMetrics};
use scheduler_domain::{
    now_millis, Calendar, JobDataMap, JobDetail, JobKey, JobStore, Schedule, Trigger, TriggerKey,
    TriggerState, MANUAL_TRIGGER_GROUP,
};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_worker::{JobCompletion, ListenerManager, RunningJob, WorkerPool};

use crate::completion::CompletionProcessor;
use crate::health::{HealthReporter, SchedulerHealth};
use crate::recovery::RecoveryProcessor;
use crate::scheduler_thread::{DispatchSettings, SchedulerState, SchedulerThread};
use crate::signal::{SchedulerSignalerImpl, SchedulingSignal};

/// 调度器运行概况
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerMetaData {
    pub scheduler_name: String,
    pub instance_id: String,
    pub state: SchedulerState,
    pub running_since: Option<DateTime<Utc>>,
    pub jobs_executed: u64,
    pub thread_pool_size: usize,
    pub busy_workers: usize,
    pub clustered: bool,
    pub misfire_threshold_ms: i64,
    pub job_store: String,
}

/// 构造调度器所需的组件
pub struct SchedulerComponents {
    pub config: AppConfig,
    pub instance_id: String,
    pub store: Arc<dyn JobStore>,
    pub store_name: String,
    pub registry: JobRegistry,
    pub metrics: SchedulerMetrics,
}

struct SchedulerInner {
    name: String,
    instance_id: String,
    config: AppConfig,
    settings: DispatchSettings,
    store: Arc<dyn JobStore>,
    store_name: String,
    pool: Arc<WorkerPool>,
    completions: Mutex<Option<mpsc::UnboundedReceiver<JobCompletion>>>,
    registry: JobRegistry,
    listeners: Arc<ListenerManager>,
    signal: Arc<SchedulingSignal>,
    health: HealthReporter,
    metrics: SchedulerMetrics,
    state: watch::Sender<SchedulerState>,
    halt: CancellationToken,
    drain: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    completion_task: Mutex<Option<JoinHandle<()>>>,
    store_started: AtomicBool,
    running_since: RwLock<Option<DateTime<Utc>>>,
    jobs_executed: Arc<AtomicU64>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// 创建调度器并初始化存储；调度器处于 STOPPED 状态，需调用 `start`
    pub async fn new(components: SchedulerComponents) -> SchedulerResult<Self> {
        let SchedulerComponents {
            config,
            instance_id,
            store,
            store_name,
            registry,
            metrics,
        } = components;

        let listeners = Arc::new(ListenerManager::new());
        let signal = Arc::new(SchedulingSignal::new());
        let signaler = Arc::new(SchedulerSignalerImpl::new(
            Arc::clone(&listeners),
            Arc::clone(&signal),
        ));
        store.initialize(signaler).await?;

        let (pool, completions) = WorkerPool::new(config.thread_pool.thread_count, metrics.clone());
        let settings = DispatchSettings::from_config(&config.scheduler, config.thread_pool.job_timeout());
        let (state, _) = watch::channel(SchedulerState::Stopped);

        info!(
            scheduler = %config.scheduler.name,
            instance_id = %instance_id,
            threads = config.thread_pool.thread_count,
            clustered = store.is_clustered(),
            "调度器已创建"
        );

        Ok(Self {
            inner: Arc::new(SchedulerInner {
                name: config.scheduler.name.clone(),
                instance_id,
                config,
                settings,
                store,
                store_name,
                pool: Arc::new(pool),
                completions: Mutex::new(Some(completions)),
                registry,
                listeners,
                signal,
                health: HealthReporter::new(),
                metrics,
                state,
                halt: CancellationToken::new(),
                drain: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                completion_task: Mutex::new(None),
                store_started: AtomicBool::new(false),
                running_since: RwLock::new(None),
                jobs_executed: Arc::new(AtomicU64::new(0)),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn listener_manager(&self) -> Arc<ListenerManager> {
        Arc::clone(&self.inner.listeners)
    }

    pub fn job_registry(&self) -> &JobRegistry {
        &self.inner.registry
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::clone(&self.inner.store)
    }

    // ---- 生命周期 ----

    pub fn state(&self) -> SchedulerState {
        *self.inner.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.state() == SchedulerState::Running
    }

    pub fn is_in_standby(&self) -> bool {
        matches!(self.state(), SchedulerState::Stopped | SchedulerState::Paused)
    }

    pub fn is_shutdown(&self) -> bool {
        self.state() == SchedulerState::ShutDown
    }

    fn ensure_not_shut_down(&self) -> SchedulerResult<()> {
        if self.is_shutdown() {
            return Err(SchedulerError::SchedulerShutdown);
        }
        Ok(())
    }

    /// 启动或从待机恢复；首次启动时完成启动恢复（或集群首次心跳）并启动后台任务
    pub async fn start(&self) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        if self.is_started() {
            return Ok(());
        }

        if !self.inner.store_started.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.inner.store.scheduler_started().await {
                self.inner.store_started.store(false, Ordering::SeqCst);
                error!(error = %e, "作业存储启动失败");
                return Err(e);
            }
            self.spawn_background_tasks().await;
        }

        {
            let mut since = self.inner.running_since.write().await;
            if since.is_none() {
                *since = Some(now_millis());
            }
        }
        self.inner.state.send_replace(SchedulerState::Running);
        self.inner.signal.signal(None);
        info!(scheduler = %self.inner.name, instance_id = %self.inner.instance_id, "调度器已启动");
        Ok(())
    }

    /// 延迟指定时长后启动
    pub fn start_delayed(&self, delay: Duration) -> JoinHandle<()> {
        let scheduler = self.clone();
        let halt = self.inner.halt.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = scheduler.start().await {
                        error!(error = %e, "延迟启动调度器失败");
                    }
                }
                _ = halt.cancelled() => debug!("调度器已关闭，取消延迟启动"),
            }
        })
    }

    /// 进入待机：停止获取触发器，正在执行的作业继续
    pub async fn standby(&self) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.state.send_replace(SchedulerState::Paused);
        info!(scheduler = %self.inner.name, "调度器进入待机");
        Ok(())
    }

    async fn spawn_background_tasks(&self) {
        let inner = &self.inner;
        let mut tasks = inner.tasks.lock().await;

        let thread = SchedulerThread {
            store: Arc::clone(&inner.store),
            pool: Arc::clone(&inner.pool),
            registry: inner.registry.clone(),
            listeners: Arc::clone(&inner.listeners),
            metrics: inner.metrics.clone(),
            signal: Arc::clone(&inner.signal),
            health: inner.health.clone(),
            state: inner.state.subscribe(),
            halt: inner.halt.clone(),
            settings: inner.settings.clone(),
        };
        tasks.push(tokio::spawn(thread.run()));

        let recovery = RecoveryProcessor {
            store: Arc::clone(&inner.store),
            listeners: Arc::clone(&inner.listeners),
            health: inner.health.clone(),
            halt: inner.halt.clone(),
            misfire_scan_interval: inner
                .store
                .misfire_threshold()
                .to_std()
                .unwrap_or(Duration::from_secs(60)),
            checkin_interval: inner.config.job_store.cluster_checkin_interval(),
            db_failure_retry_interval: inner.settings.db_failure_retry_interval,
        };
        if inner.store.is_clustered() {
            tasks.push(tokio::spawn(recovery.clone().run_cluster_manager()));
        }
        tasks.push(tokio::spawn(recovery.run_misfire_handler()));

        if let Some(completions) = inner.completions.lock().await.take() {
            let processor = CompletionProcessor {
                store: Arc::clone(&inner.store),
                listeners: Arc::clone(&inner.listeners),
                completions,
                jobs_executed: Arc::clone(&inner.jobs_executed),
                retry_interval: inner.settings.db_failure_retry_interval,
                drain: inner.drain.clone(),
                abandon: inner.halt.clone(),
            };
            *inner.completion_task.lock().await = Some(tokio::spawn(processor.run()));
        }
    }

    /// 关闭调度器：停止获取触发器，按需等待正在执行的作业，最后注销本实例
    pub async fn shutdown(&self, wait_for_jobs: bool) -> SchedulerResult<()> {
        if self.is_shutdown() {
            return Ok(());
        }
        info!(scheduler = %self.inner.name, wait_for_jobs, "调度器正在关闭");
        self.inner.state.send_replace(SchedulerState::ShutDown);

        // 先停止调度循环，再关闭执行池，最后写回剩余的执行结果
        self.inner.halt.cancel();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "后台任务异常结束");
            }
        }

        self.inner
            .pool
            .shutdown(wait_for_jobs, self.inner.config.scheduler.interrupt_jobs_on_shutdown)
            .await;

        self.inner.drain.cancel();
        if let Some(task) = self.inner.completion_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "执行结果处理任务异常结束");
            }
        }

        if self.inner.store_started.load(Ordering::SeqCst) {
            if let Err(e) = self.inner.store.shutdown(true).await {
                error!(error = %e, "关闭作业存储失败");
            }
        }
        info!(scheduler = %self.inner.name, "调度器已关闭");
        Ok(())
    }

    // ---- 作业与触发器 ----

    /// 添加没有触发器的作业，必须是持久作业（替换已有作业时除外）
    pub async fn add_job(&self, job: JobDetail, replace: bool) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        job.validate()?;
        if !job.durable && !replace {
            return Err(SchedulerError::validation_error("没有触发器的作业必须是持久作业"));
        }
        self.warn_if_unregistered(&job.job_type).await;
        self.inner.store.store_job(&job, replace).await?;
        self.inner.signal.signal(None);
        self.inner.listeners.notify_job_added(&job).await;
        Ok(())
    }

    /// 添加作业和它的第一个触发器，返回首次触发时间
    pub async fn schedule_job(&self, job: JobDetail, mut trigger: Trigger) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_not_shut_down()?;
        job.validate()?;
        if trigger.job_key != job.key {
            return Err(SchedulerError::validation_error(format!(
                "触发器 {} 引用的作业 {} 与作业 {} 不一致",
                trigger.key, trigger.job_key, job.key
            )));
        }
        trigger.validate()?;
        self.warn_if_unregistered(&job.job_type).await;
        let first_fire_time = self.compute_first_fire_time(&mut trigger).await?;

        self.inner.store.store_job_and_trigger(&job, &trigger).await?;
        self.inner.listeners.notify_job_added(&job).await;
        self.inner.signal.signal(Some(first_fire_time));
        self.inner.listeners.notify_job_scheduled(&trigger).await;
        info!(job = %job.key, trigger = %trigger.key, first_fire_time = %first_fire_time, "作业已调度");
        Ok(first_fire_time)
    }

    /// 为已存在的作业添加触发器
    pub async fn schedule_trigger(&self, mut trigger: Trigger) -> SchedulerResult<DateTime<Utc>> {
        self.ensure_not_shut_down()?;
        trigger.validate()?;
        let first_fire_time = self.compute_first_fire_time(&mut trigger).await?;

        self.inner.store.store_trigger(&trigger, false).await?;
        self.inner.signal.signal(Some(first_fire_time));
        self.inner.listeners.notify_job_scheduled(&trigger).await;
        info!(trigger = %trigger.key, job = %trigger.job_key, first_fire_time = %first_fire_time, "触发器已调度");
        Ok(first_fire_time)
    }

    /// 用新触发器替换旧触发器；旧触发器不存在时返回 None
    pub async fn reschedule_job(
        &self,
        trigger_key: &TriggerKey,
        mut new_trigger: Trigger,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        self.ensure_not_shut_down()?;
        let Some(old_trigger) = self.inner.store.retrieve_trigger(trigger_key).await? else {
            return Ok(None);
        };
        new_trigger.job_key = old_trigger.job_key;
        new_trigger.validate()?;
        let first_fire_time = self.compute_first_fire_time(&mut new_trigger).await?;

        if !self.inner.store.replace_trigger(trigger_key, &new_trigger).await? {
            return Ok(None);
        }
        self.inner.signal.signal(Some(first_fire_time));
        self.inner.listeners.notify_job_unscheduled(trigger_key).await;
        self.inner.listeners.notify_job_scheduled(&new_trigger).await;
        info!(old = %trigger_key, new = %new_trigger.key, first_fire_time = %first_fire_time, "触发器已重新调度");
        Ok(Some(first_fire_time))
    }

    pub async fn unschedule_job(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        self.ensure_not_shut_down()?;
        let removed = self.inner.store.remove_trigger(trigger_key).await?;
        if removed {
            self.inner.signal.signal(None);
            self.inner.listeners.notify_job_unscheduled(trigger_key).await;
        }
        Ok(removed)
    }

    /// 删除作业及其全部触发器
    pub async fn delete_job(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        self.ensure_not_shut_down()?;
        let triggers = self.inner.store.get_triggers_for_job(job_key).await?;
        let removed = self.inner.store.remove_job(job_key).await?;
        if removed {
            self.inner.signal.signal(None);
            for trigger in &triggers {
                self.inner.listeners.notify_job_unscheduled(&trigger.key).await;
            }
            self.inner.listeners.notify_job_deleted(job_key).await;
            info!(job = %job_key, triggers = triggers.len(), "作业已删除");
        }
        Ok(removed)
    }

    /// 立即触发一次作业
    pub async fn trigger_job(&self, job_key: &JobKey, data: Option<JobDataMap>) -> SchedulerResult<TriggerKey> {
        self.ensure_not_shut_down()?;
        if !self.inner.store.check_job_exists(job_key).await? {
            return Err(SchedulerError::job_not_found(job_key.to_string()));
        }

        let mut trigger = Trigger::new(
            TriggerKey::new(format!("MT_{}", uuid::Uuid::new_v4().simple()), MANUAL_TRIGGER_GROUP),
            job_key.clone(),
            Schedule::once(),
        )
        .with_start_time(now_millis());
        if let Some(data) = data {
            trigger.job_data = data;
        }
        let first_fire_time = self.compute_first_fire_time(&mut trigger).await?;

        self.inner.store.store_trigger(&trigger, false).await?;
        self.inner.signal.signal(Some(first_fire_time));
        self.inner.listeners.notify_job_scheduled(&trigger).await;
        info!(job = %job_key, trigger = %trigger.key, "已手动触发作业");
        Ok(trigger.key)
    }

    async fn compute_first_fire_time(&self, trigger: &mut Trigger) -> SchedulerResult<DateTime<Utc>> {
        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => Some(
                self.inner
                    .store
                    .retrieve_calendar(name)
                    .await?
                    .ok_or_else(|| SchedulerError::calendar_not_found(name))?,
            ),
            None => None,
        };
        trigger.compute_first_fire_time(calendar.as_ref()).ok_or_else(|| {
            SchedulerError::invalid_schedule(format!("触发器 {} 永远不会触发", trigger.key))
        })
    }

    async fn warn_if_unregistered(&self, job_type: &str) {
        if !self.inner.registry.contains(job_type).await {
            warn!(job_type, "作业类型未在本实例注册，只能由注册了该类型的实例执行");
        }
    }

    // ---- 暂停与恢复 ----

    pub async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.pause_trigger(trigger_key).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.resume_trigger(trigger_key).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.pause_job(job_key).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.resume_job(job_key).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn pause_trigger_group(&self, group: &str) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.pause_trigger_group(group).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn resume_trigger_group(&self, group: &str) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.resume_trigger_group(group).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn pause_job_group(&self, group: &str) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.pause_job_group(group).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn resume_job_group(&self, group: &str) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.resume_job_group(group).await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn pause_all(&self) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.pause_all().await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn resume_all(&self) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.resume_all().await?;
        self.inner.signal.signal(None);
        Ok(())
    }

    pub async fn get_paused_trigger_groups(&self) -> SchedulerResult<HashSet<String>> {
        self.inner.store.get_paused_trigger_groups().await
    }

    // ---- 日历 ----

    pub async fn add_calendar(
        &self,
        name: &str,
        calendar: Calendar,
        replace: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner
            .store
            .store_calendar(name, &calendar, replace, update_triggers)
            .await?;
        if update_triggers {
            self.inner.signal.signal(None);
        }
        Ok(())
    }

    pub async fn delete_calendar(&self, name: &str) -> SchedulerResult<bool> {
        self.ensure_not_shut_down()?;
        self.inner.store.remove_calendar(name).await
    }

    pub async fn get_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        self.inner.store.retrieve_calendar(name).await
    }

    pub async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>> {
        self.inner.store.get_calendar_names().await
    }

    // ---- 查询 ----

    pub async fn get_job_detail(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        self.inner.store.retrieve_job(job_key).await
    }

    pub async fn get_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        self.inner.store.retrieve_trigger(trigger_key).await
    }

    pub async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        self.inner.store.get_trigger_state(trigger_key).await
    }

    pub async fn get_triggers_of_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        self.inner.store.get_triggers_for_job(job_key).await
    }

    pub async fn get_job_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<JobKey>> {
        self.inner.store.get_job_keys(group).await
    }

    pub async fn get_trigger_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<TriggerKey>> {
        self.inner.store.get_trigger_keys(group).await
    }

    pub async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.inner.store.get_job_group_names().await
    }

    pub async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        self.inner.store.get_trigger_group_names().await
    }

    pub async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        self.inner.store.check_job_exists(job_key).await
    }

    pub async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        self.inner.store.check_trigger_exists(trigger_key).await
    }

    /// 清空全部调度数据
    pub async fn clear(&self) -> SchedulerResult<()> {
        self.ensure_not_shut_down()?;
        self.inner.store.clear_all_scheduling_data().await?;
        self.inner.signal.signal(None);
        warn!(scheduler = %self.inner.name, "已清空全部调度数据");
        Ok(())
    }

    // ---- 执行中的作业 ----

    /// 本实例正在执行的作业
    pub async fn get_currently_executing_jobs(&self) -> Vec<RunningJob> {
        self.inner.pool.running_jobs().await
    }

    /// 中断本实例上该作业的所有执行，返回是否有执行被中断
    pub async fn interrupt(&self, job_key: &JobKey) -> bool {
        self.inner.pool.interrupt_job(job_key).await > 0
    }

    pub async fn interrupt_instance(&self, fire_instance_id: &str) -> bool {
        self.inner.pool.interrupt_instance(fire_instance_id).await
    }

    // ---- 状态 ----

    pub async fn metadata(&self) -> SchedulerMetaData {
        SchedulerMetaData {
            scheduler_name: self.inner.name.clone(),
            instance_id: self.inner.instance_id.clone(),
            state: self.state(),
            running_since: *self.inner.running_since.read().await,
            jobs_executed: self.inner.jobs_executed.load(Ordering::Relaxed),
            thread_pool_size: self.inner.pool.size(),
            busy_workers: self.inner.pool.busy_count(),
            clustered: self.inner.store.is_clustered(),
            misfire_threshold_ms: self.inner.store.misfire_threshold().num_milliseconds(),
            job_store: self.inner.store_name.clone(),
        }
    }

    pub fn health(&self) -> SchedulerHealth {
        self.inner.health.current()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SchedulerHealth> {
        self.inner.health.subscribe()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.inner.name)
            .field("instance_id", &self.inner.instance_id)
            .field("state", &self.state())
            .finish()
    }
}
