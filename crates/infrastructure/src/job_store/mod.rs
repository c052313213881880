//! 基于 SQLite 的持久化作业存储
//!
//! 每个操作在一个会话里完成：取得连接（按事务边界策略开启事务），按 STATE_ACCESS、
//! TRIGGER_ACCESS 的顺序获取需要的集群锁，执行语句，成功提交、失败回滚，最后总是释放锁。
//! 事务中产生的事件在提交后才发给调度器。

mod cluster;
mod delegate;
mod events;
mod firing;
mod misfire;
mod pause;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};

use scheduler_core::config::{bounded_millis, JobStoreConfig, LockHandlerKind, TransactionMode};
use scheduler_core::SchedulerMetrics;
use scheduler_domain::{
    now_millis, Calendar, CompletedExecutionInstruction, FiredTriggerRecord, JobDetail, JobKey,
    JobStore, MisfireScanResult, NoopSignaler, RecoveryReport, SchedulerSignaler,
    SchedulerStateRecord, Trigger, TriggerFiredResult, TriggerKey, TriggerState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::database::DatabaseManager;
use crate::locks::{semaphore_for, LockToken, Semaphore, TRIGGER_ACCESS};
use crate::retry::RetryPolicy;
use crate::transaction::{
    transaction_boundary_for, SelfManagedTransactions, StoreConnection, TransactionBoundary,
};

pub use delegate::{StoreDelegate, ALL_GROUPS_PAUSED};
use events::PendingEvents;

/// 在会话中执行一段受保护的操作，瞬时错误时整体重试
///
/// 操作体只能捕获引用（可复制），这样重试时可以重新构造。
macro_rules! in_session {
    ($store:expr, $op:literal, $locks:expr, |$session:ident| $body:expr) => {{
        let store = $store;
        store
            .retry
            .run($op, move || async move {
                let started = std::time::Instant::now();
                let mut $session = store.begin_session($locks).await?;
                let result = $body.await;
                let result = store.finish_session($session, result).await;
                store.metrics.record_store_operation($op, started.elapsed());
                result
            })
            .await
    }};
}
pub(crate) use in_session;

/// 作业存储的运行参数
#[derive(Debug, Clone)]
pub struct JobStoreOptions {
    pub sched_name: String,
    pub instance_id: String,
    pub clustered: bool,
    pub cluster_checkin_interval: StdDuration,
    pub misfire_threshold: Duration,
    pub max_misfires_to_handle_at_a_time: usize,
    pub acquire_triggers_within_lock: bool,
    pub lock_handler: LockHandlerKind,
    pub transaction_mode: TransactionMode,
    pub retry: RetryPolicy,
}

impl JobStoreOptions {
    pub fn from_config(sched_name: &str, instance_id: &str, config: &JobStoreConfig) -> Self {
        Self {
            sched_name: sched_name.to_string(),
            instance_id: instance_id.to_string(),
            clustered: config.clustered,
            cluster_checkin_interval: config.cluster_checkin_interval(),
            misfire_threshold: bounded_millis(config.misfire_threshold_ms),
            max_misfires_to_handle_at_a_time: config.max_misfires_to_handle_at_a_time,
            acquire_triggers_within_lock: config.acquire_triggers_within_lock,
            lock_handler: config.lock_handler,
            transaction_mode: config.transaction_mode,
            retry: RetryPolicy::new(config.retry_attempts, config.retry_interval()),
        }
    }
}

/// 一次存储操作的连接、持有的锁以及待发送的事件
pub(crate) struct StoreSession {
    conn: StoreConnection,
    locks: Vec<LockToken>,
    self_managed: bool,
    events: PendingEvents,
}

impl StoreSession {
    fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.conn
    }
}

pub struct SqlJobStore {
    options: JobStoreOptions,
    db: DatabaseManager,
    delegate: StoreDelegate,
    boundary: Box<dyn TransactionBoundary>,
    semaphore: Box<dyn Semaphore>,
    signaler: RwLock<Arc<dyn SchedulerSignaler>>,
    metrics: SchedulerMetrics,
    retry: RetryPolicy,
    first_checkin: AtomicBool,
    /// 本实例上一次心跳的毫秒时间戳，0 表示还没有心跳
    last_checkin_ms: AtomicI64,
}

impl SqlJobStore {
    pub fn new(db: DatabaseManager, options: JobStoreOptions) -> Self {
        let semaphore =
            semaphore_for(options.lock_handler, &options.sched_name, &options.instance_id);
        Self::with_semaphore(db, options, semaphore)
    }

    pub fn with_semaphore(
        db: DatabaseManager,
        options: JobStoreOptions,
        semaphore: Box<dyn Semaphore>,
    ) -> Self {
        info!(
            sched_name = %options.sched_name,
            instance_id = %options.instance_id,
            clustered = options.clustered,
            lock_handler = ?options.lock_handler,
            transaction_mode = ?options.transaction_mode,
            "创建作业存储"
        );
        Self {
            delegate: StoreDelegate::new(options.sched_name.clone()),
            boundary: transaction_boundary_for(options.transaction_mode),
            semaphore,
            signaler: RwLock::new(Arc::new(NoopSignaler)),
            metrics: SchedulerMetrics::new(),
            retry: options.retry,
            first_checkin: AtomicBool::new(true),
            last_checkin_ms: AtomicI64::new(0),
            db,
            options,
        }
    }

    pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn options(&self) -> &JobStoreOptions {
        &self.options
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.db
    }

    fn boundary(&self, self_managed: bool) -> &dyn TransactionBoundary {
        if self_managed {
            &SelfManagedTransactions
        } else {
            self.boundary.as_ref()
        }
    }

    /// 开启会话并按顺序获取锁；获取失败时回滚并释放已持有的锁
    pub(crate) async fn begin_session(
        &self,
        locks: &[&'static str],
    ) -> SchedulerResult<StoreSession> {
        // 行锁必须和受保护的语句在同一个事务里
        let self_managed = !locks.is_empty() && self.semaphore.requires_connection();
        let boundary = self.boundary(self_managed);
        let conn = boundary.begin(self.db.pool()).await?;
        let mut session = StoreSession {
            conn,
            locks: Vec::with_capacity(locks.len()),
            self_managed,
            events: PendingEvents::default(),
        };
        for &lock_name in locks {
            if let Err(e) = self.obtain_lock(&mut session, lock_name).await {
                let StoreSession { conn, locks, .. } = session;
                boundary.rollback(conn).await;
                self.release_locks(locks).await;
                return Err(e);
            }
        }
        Ok(session)
    }

    /// 在已开启的会话中追加获取一把锁
    pub(crate) async fn obtain_lock(
        &self,
        session: &mut StoreSession,
        lock_name: &'static str,
    ) -> SchedulerResult<()> {
        if session.locks.iter().any(|t| t.lock_name() == lock_name) {
            return Err(SchedulerError::Internal(format!("重复获取锁 {lock_name}")));
        }
        let conn = if self.semaphore.requires_connection() {
            if !session.conn.is_transactional() {
                return Err(SchedulerError::Internal(format!(
                    "获取行锁 {lock_name} 需要事务连接"
                )));
            }
            Some(session.conn())
        } else {
            None
        };
        let token = self.semaphore.obtain_lock(conn, lock_name).await?;
        session.locks.push(token);
        Ok(())
    }

    async fn release_locks(&self, locks: Vec<LockToken>) {
        for token in locks.into_iter().rev() {
            self.semaphore.release_lock(token).await;
        }
    }

    /// 结束会话：成功提交、失败回滚，随后总是释放锁；提交成功后发送事件
    pub(crate) async fn finish_session<T>(
        &self,
        session: StoreSession,
        result: SchedulerResult<T>,
    ) -> SchedulerResult<T> {
        let StoreSession {
            conn,
            locks,
            self_managed,
            events,
        } = session;
        let boundary = self.boundary(self_managed);
        let outcome = match result {
            Ok(value) => boundary.commit(conn).await.map(|_| value),
            Err(e) => {
                boundary.rollback(conn).await;
                Err(e)
            }
        };
        self.release_locks(locks).await;

        if outcome.is_ok() && !events.is_empty() {
            let signaler = self.signaler.read().await.clone();
            events.dispatch(signaler.as_ref()).await;
        }
        outcome
    }

    // ---- 会话内的共用步骤 ----

    async fn store_job_in(
        &self,
        session: &mut StoreSession,
        job: &JobDetail,
        replace_existing: bool,
    ) -> SchedulerResult<()> {
        job.validate()?;
        let conn = session.conn();
        if self.delegate.job_exists(conn, &job.key).await? {
            if !replace_existing {
                return Err(SchedulerError::already_exists("job", job.key.to_string()));
            }
            self.delegate.update_job(conn, job).await?;
        } else {
            self.delegate.insert_job(conn, job).await?;
        }
        Ok(())
    }

    /// 写入触发器
    ///
    /// `force_state` 为 false 时，所在分组已暂停会改为 PAUSED，不允许并发的作业正在执行会改为 BLOCKED。
    pub(crate) async fn store_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
        replace_existing: bool,
        state: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> SchedulerResult<()> {
        trigger.validate()?;
        let conn = session.conn();
        let exists = self.delegate.trigger_exists(conn, &trigger.key).await?;
        if exists && !replace_existing {
            return Err(SchedulerError::already_exists(
                "trigger",
                trigger.key.to_string(),
            ));
        }

        let job = self
            .delegate
            .select_job(conn, &trigger.job_key)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(trigger.job_key.to_string()))?;

        let mut state = state;
        if !force_state {
            let mut paused = self
                .delegate
                .is_trigger_group_paused(conn, &trigger.key.group)
                .await?;
            if !paused && self.delegate.is_trigger_group_paused(conn, ALL_GROUPS_PAUSED).await? {
                paused = true;
                self.delegate
                    .insert_paused_trigger_group(conn, &trigger.key.group)
                    .await?;
            }
            if paused && matches!(state, TriggerState::Waiting | TriggerState::Acquired) {
                state = TriggerState::Paused;
            }
            if job.concurrent_execution_disallowed && !recovering {
                state = self.check_blocked_state(conn, &job.key, state).await?;
            }
        }

        if exists {
            self.delegate.update_trigger(conn, trigger, state).await?;
        } else {
            self.delegate.insert_trigger(conn, trigger, state).await?;
        }
        debug!(trigger = %trigger.key, state = %state, "触发器已写入");
        Ok(())
    }

    /// 作业有执行中的实例时，把等待或暂停状态换成对应的阻塞状态
    pub(crate) async fn check_blocked_state(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
        current: TriggerState,
    ) -> SchedulerResult<TriggerState> {
        if !matches!(current, TriggerState::Waiting | TriggerState::Paused) {
            return Ok(current);
        }
        let running = self.delegate.count_fired_triggers_for_job(conn, job_key).await?;
        if running == 0 {
            return Ok(current);
        }
        Ok(match current {
            TriggerState::Paused => TriggerState::PausedBlocked,
            _ => TriggerState::Blocked,
        })
    }

    /// 删除触发器；非持久作业失去最后一个触发器时一并删除
    pub(crate) async fn remove_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<Option<Trigger>> {
        let conn = session.conn();
        let Some(trigger) = self.delegate.select_trigger(conn, trigger_key).await? else {
            return Ok(None);
        };
        self.delegate.delete_trigger(conn, trigger_key).await?;

        if let Some(job) = self.delegate.select_job(conn, &trigger.job_key).await? {
            if !job.durable && self.delegate.count_triggers_for_job(conn, &job.key).await? == 0 {
                self.delegate.delete_job(conn, &job.key).await?;
                debug!(job = %job.key, "非持久作业已没有触发器，随之删除");
            }
        }
        Ok(Some(trigger))
    }

    async fn remove_job_in(
        &self,
        session: &mut StoreSession,
        job_key: &JobKey,
    ) -> SchedulerResult<bool> {
        let conn = session.conn();
        for trigger in self.delegate.select_triggers_for_job(conn, job_key).await? {
            self.delegate.delete_trigger(conn, &trigger.key).await?;
        }
        Ok(self.delegate.delete_job(conn, job_key).await? > 0)
    }

    async fn replace_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        let conn = session.conn();
        let Some(old) = self.delegate.select_trigger(conn, trigger_key).await? else {
            return Ok(false);
        };
        if old.job_key != new_trigger.job_key {
            return Err(SchedulerError::validation_error(format!(
                "新触发器 {} 必须属于作业 {}",
                new_trigger.key, old.job_key
            )));
        }
        self.delegate.delete_trigger(conn, trigger_key).await?;
        self.store_trigger_in(
            session,
            new_trigger,
            false,
            TriggerState::Waiting,
            false,
            false,
        )
        .await?;
        Ok(true)
    }

    async fn store_calendar_in(
        &self,
        session: &mut StoreSession,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        let exists = self.delegate.calendar_exists(conn, name).await?;
        if exists && !replace_existing {
            return Err(SchedulerError::already_exists("calendar", name));
        }
        self.delegate.upsert_calendar(conn, name, calendar).await?;

        if exists && update_triggers {
            let now = now_millis();
            let triggers = self.delegate.select_triggers_for_calendar(conn, name).await?;
            for mut trigger in triggers {
                trigger.update_with_new_calendar(Some(calendar), self.options.misfire_threshold, now);
                let state = trigger.state;
                self.delegate.update_trigger(conn, &trigger, state).await?;
            }
            session.events.scheduling_change(None);
        }
        Ok(())
    }

    async fn remove_calendar_in(&self, session: &mut StoreSession, name: &str) -> SchedulerResult<bool> {
        let conn = session.conn();
        if self.delegate.calendar_is_referenced(conn, name).await? {
            return Err(SchedulerError::validation_error(format!(
                "日历 {name} 仍被触发器引用，不能删除"
            )));
        }
        Ok(self.delegate.delete_calendar(conn, name).await? > 0)
    }

    async fn retire_instance_in(&self, session: &mut StoreSession) -> SchedulerResult<()> {
        let instance_id = self.options.instance_id.as_str();
        self.delegate
            .delete_scheduler_state(session.conn(), instance_id)
            .await?;
        Ok(())
    }

    fn last_checkin(&self) -> Option<DateTime<Utc>> {
        match self.last_checkin_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => DateTime::from_timestamp_millis(ms),
        }
    }
}

#[async_trait]
impl JobStore for SqlJobStore {
    async fn initialize(&self, signaler: Arc<dyn SchedulerSignaler>) -> SchedulerResult<()> {
        *self.signaler.write().await = signaler;
        self.db.initialize_schema().await?;
        info!(
            sched_name = %self.options.sched_name,
            instance_id = %self.options.instance_id,
            "作业存储已初始化"
        );
        Ok(())
    }

    async fn scheduler_started(&self) -> SchedulerResult<()> {
        if self.options.clustered {
            let report = self.check_in_and_recover().await?;
            info!(
                failed_instances = report.failed_instances.len(),
                recovered = report.recovered_records,
                "集群模式启动：已完成首次心跳"
            );
        } else {
            self.recover_jobs().await?;
        }
        Ok(())
    }

    async fn shutdown(&self, retire_instance: bool) -> SchedulerResult<()> {
        if self.options.clustered && retire_instance {
            in_session!(self, "retire_instance", &[], |session| self
                .retire_instance_in(&mut session))?;
            info!(instance_id = %self.options.instance_id, "已删除本实例的心跳记录");
        }
        Ok(())
    }

    fn is_clustered(&self) -> bool {
        self.options.clustered
    }

    fn instance_id(&self) -> &str {
        &self.options.instance_id
    }

    fn misfire_threshold(&self) -> Duration {
        self.options.misfire_threshold
    }

    #[instrument(skip(self, job, trigger), fields(job = %job.key, trigger = %trigger.key))]
    async fn store_job_and_trigger(&self, job: &JobDetail, trigger: &Trigger) -> SchedulerResult<()> {
        in_session!(self, "store_job_and_trigger", &[TRIGGER_ACCESS], |session| async {
            self.store_job_in(&mut session, job, false).await?;
            self.store_trigger_in(&mut session, trigger, false, TriggerState::Waiting, false, false)
                .await
        })
    }

    #[instrument(skip(self, job), fields(job = %job.key))]
    async fn store_job(&self, job: &JobDetail, replace_existing: bool) -> SchedulerResult<()> {
        in_session!(self, "store_job", &[TRIGGER_ACCESS], |session| self.store_job_in(
            &mut session,
            job,
            replace_existing
        ))
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn store_trigger(&self, trigger: &Trigger, replace_existing: bool) -> SchedulerResult<()> {
        in_session!(self, "store_trigger", &[TRIGGER_ACCESS], |session| self
            .store_trigger_in(
                &mut session,
                trigger,
                replace_existing,
                TriggerState::Waiting,
                false,
                false
            ))
    }

    #[instrument(skip(self), fields(job = %job_key))]
    async fn remove_job(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        in_session!(self, "remove_job", &[TRIGGER_ACCESS], |session| self
            .remove_job_in(&mut session, job_key))
    }

    #[instrument(skip(self), fields(trigger = %trigger_key))]
    async fn remove_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        let removed = in_session!(self, "remove_trigger", &[TRIGGER_ACCESS], |session| self
            .remove_trigger_in(&mut session, trigger_key))?;
        Ok(removed.is_some())
    }

    #[instrument(skip(self, new_trigger), fields(trigger = %trigger_key))]
    async fn replace_trigger(
        &self,
        trigger_key: &TriggerKey,
        new_trigger: &Trigger,
    ) -> SchedulerResult<bool> {
        in_session!(self, "replace_trigger", &[TRIGGER_ACCESS], |session| self
            .replace_trigger_in(&mut session, trigger_key, new_trigger))
    }

    async fn retrieve_job(&self, job_key: &JobKey) -> SchedulerResult<Option<JobDetail>> {
        in_session!(self, "retrieve_job", &[], |session| self
            .delegate
            .select_job(session.conn(), job_key))
    }

    async fn retrieve_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<Trigger>> {
        in_session!(self, "retrieve_trigger", &[], |session| self
            .delegate
            .select_trigger(session.conn(), trigger_key))
    }

    async fn check_job_exists(&self, job_key: &JobKey) -> SchedulerResult<bool> {
        in_session!(self, "check_job_exists", &[], |session| self
            .delegate
            .job_exists(session.conn(), job_key))
    }

    async fn check_trigger_exists(&self, trigger_key: &TriggerKey) -> SchedulerResult<bool> {
        in_session!(self, "check_trigger_exists", &[], |session| self
            .delegate
            .trigger_exists(session.conn(), trigger_key))
    }

    async fn get_trigger_state(&self, trigger_key: &TriggerKey) -> SchedulerResult<Option<TriggerState>> {
        in_session!(self, "get_trigger_state", &[], |session| self
            .delegate
            .select_trigger_state(session.conn(), trigger_key))
    }

    async fn get_triggers_for_job(&self, job_key: &JobKey) -> SchedulerResult<Vec<Trigger>> {
        in_session!(self, "get_triggers_for_job", &[], |session| self
            .delegate
            .select_triggers_for_job(session.conn(), job_key))
    }

    async fn get_job_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<JobKey>> {
        in_session!(self, "get_job_keys", &[], |session| self
            .delegate
            .select_job_keys(session.conn(), group))
    }

    async fn get_trigger_keys(&self, group: Option<&str>) -> SchedulerResult<Vec<TriggerKey>> {
        in_session!(self, "get_trigger_keys", &[], |session| self
            .delegate
            .select_trigger_keys(session.conn(), group))
    }

    async fn get_job_group_names(&self) -> SchedulerResult<Vec<String>> {
        in_session!(self, "get_job_group_names", &[], |session| self
            .delegate
            .select_job_groups(session.conn()))
    }

    async fn get_trigger_group_names(&self) -> SchedulerResult<Vec<String>> {
        in_session!(self, "get_trigger_group_names", &[], |session| self
            .delegate
            .select_trigger_groups(session.conn()))
    }

    async fn get_number_of_jobs(&self) -> SchedulerResult<usize> {
        in_session!(self, "get_number_of_jobs", &[], |session| self
            .delegate
            .count_jobs(session.conn()))
    }

    async fn get_number_of_triggers(&self) -> SchedulerResult<usize> {
        in_session!(self, "get_number_of_triggers", &[], |session| self
            .delegate
            .count_triggers(session.conn()))
    }

    #[instrument(skip(self))]
    async fn clear_all_scheduling_data(&self) -> SchedulerResult<()> {
        in_session!(self, "clear_all_scheduling_data", &[TRIGGER_ACCESS], |session| self
            .delegate
            .clear_data(session.conn()))?;
        warn!(sched_name = %self.options.sched_name, "已清空全部调度数据");
        Ok(())
    }

    #[instrument(skip(self, calendar))]
    async fn store_calendar(
        &self,
        name: &str,
        calendar: &Calendar,
        replace_existing: bool,
        update_triggers: bool,
    ) -> SchedulerResult<()> {
        in_session!(self, "store_calendar", &[TRIGGER_ACCESS], |session| self
            .store_calendar_in(&mut session, name, calendar, replace_existing, update_triggers))
    }

    #[instrument(skip(self))]
    async fn remove_calendar(&self, name: &str) -> SchedulerResult<bool> {
        in_session!(self, "remove_calendar", &[TRIGGER_ACCESS], |session| self
            .remove_calendar_in(&mut session, name))
    }

    async fn retrieve_calendar(&self, name: &str) -> SchedulerResult<Option<Calendar>> {
        in_session!(self, "retrieve_calendar", &[], |session| self
            .delegate
            .select_calendar(session.conn(), name))
    }

    async fn get_calendar_names(&self) -> SchedulerResult<Vec<String>> {
        in_session!(self, "get_calendar_names", &[], |session| self
            .delegate
            .select_calendar_names(session.conn()))
    }

    #[instrument(skip(self), fields(trigger = %trigger_key))]
    async fn pause_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        in_session!(self, "pause_trigger", &[TRIGGER_ACCESS], |session| self
            .pause_trigger_in(&mut session, trigger_key))
    }

    #[instrument(skip(self), fields(trigger = %trigger_key))]
    async fn resume_trigger(&self, trigger_key: &TriggerKey) -> SchedulerResult<()> {
        in_session!(self, "resume_trigger", &[TRIGGER_ACCESS], |session| self
            .resume_trigger_in(&mut session, trigger_key))
    }

    #[instrument(skip(self), fields(job = %job_key))]
    async fn pause_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        in_session!(self, "pause_job", &[TRIGGER_ACCESS], |session| self
            .pause_job_in(&mut session, job_key))
    }

    #[instrument(skip(self), fields(job = %job_key))]
    async fn resume_job(&self, job_key: &JobKey) -> SchedulerResult<()> {
        in_session!(self, "resume_job", &[TRIGGER_ACCESS], |session| self
            .resume_job_in(&mut session, job_key))
    }

    #[instrument(skip(self))]
    async fn pause_trigger_group(&self, group: &str) -> SchedulerResult<()> {
        in_session!(self, "pause_trigger_group", &[TRIGGER_ACCESS], |session| self
            .pause_trigger_group_in(&mut session, group))
    }

    #[instrument(skip(self))]
    async fn resume_trigger_group(&self, group: &str) -> SchedulerResult<()> {
        in_session!(self, "resume_trigger_group", &[TRIGGER_ACCESS], |session| self
            .resume_trigger_group_in(&mut session, group))
    }

    #[instrument(skip(self))]
    async fn pause_job_group(&self, group: &str) -> SchedulerResult<()> {
        in_session!(self, "pause_job_group", &[TRIGGER_ACCESS], |session| self
            .pause_job_group_in(&mut session, group))
    }

    #[instrument(skip(self))]
    async fn resume_job_group(&self, group: &str) -> SchedulerResult<()> {
        in_session!(self, "resume_job_group", &[TRIGGER_ACCESS], |session| self
            .resume_job_group_in(&mut session, group))
    }

    #[instrument(skip(self))]
    async fn pause_all(&self) -> SchedulerResult<()> {
        in_session!(self, "pause_all", &[TRIGGER_ACCESS], |session| self
            .pause_all_in(&mut session))
    }

    #[instrument(skip(self))]
    async fn resume_all(&self) -> SchedulerResult<()> {
        in_session!(self, "resume_all", &[TRIGGER_ACCESS], |session| self
            .resume_all_in(&mut session))
    }

    async fn get_paused_trigger_groups(&self) -> SchedulerResult<HashSet<String>> {
        let groups = in_session!(self, "get_paused_trigger_groups", &[], |session| self
            .delegate
            .select_paused_trigger_groups(session.conn()))?;
        Ok(groups
            .into_iter()
            .filter(|g| g != ALL_GROUPS_PAUSED)
            .collect())
    }

    async fn acquire_next_triggers(
        &self,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let within_lock = self.options.acquire_triggers_within_lock || max_count > 1;
        let locks: &[&'static str] = if within_lock { &[TRIGGER_ACCESS] } else { &[] };
        let acquired = in_session!(self, "acquire_next_triggers", locks, |session| self
            .acquire_next_triggers_in(&mut session, no_later_than, max_count, time_window))?;
        if !acquired.is_empty() {
            self.metrics.record_triggers_acquired(acquired.len());
        }
        Ok(acquired)
    }

    #[instrument(skip(self, trigger), fields(trigger = %trigger.key))]
    async fn release_acquired_trigger(&self, trigger: &Trigger) -> SchedulerResult<()> {
        in_session!(self, "release_acquired_trigger", &[TRIGGER_ACCESS], |session| self
            .release_acquired_trigger_in(&mut session, trigger))
    }

    async fn triggers_fired(&self, triggers: &[Trigger]) -> SchedulerResult<Vec<TriggerFiredResult>> {
        in_session!(self, "triggers_fired", &[TRIGGER_ACCESS], |session| self
            .triggers_fired_in(&mut session, triggers))
    }

    #[instrument(skip(self, trigger, job), fields(trigger = %trigger.key, instruction = %instruction))]
    async fn triggered_job_complete(
        &self,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<bool> {
        in_session!(self, "triggered_job_complete", &[TRIGGER_ACCESS], |session| self
            .triggered_job_complete_in(&mut session, trigger, job, instruction))
    }

    async fn recover_misfired_triggers(&self) -> SchedulerResult<MisfireScanResult> {
        self.do_recover_misfires().await
    }

    async fn check_in_and_recover(&self) -> SchedulerResult<RecoveryReport> {
        self.do_check_in().await
    }

    async fn get_fired_trigger_records(&self) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        in_session!(self, "get_fired_trigger_records", &[], |session| self
            .delegate
            .select_all_fired_triggers(session.conn()))
    }

    async fn get_scheduler_instances(&self) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        in_session!(self, "get_scheduler_instances", &[], |session| self
            .delegate
            .select_scheduler_states(session.conn()))
    }
}
