//! 获取、触发与完成

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_domain::{
    now_millis, CompletedExecutionInstruction, FiredTriggerState, JobDetail, JobKey, Trigger,
    TriggerFiredBundle, TriggerFiredResult, TriggerState, RECOVERING_JOBS_GROUP,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

use super::delegate::new_fired_record;
use super::{SqlJobStore, StoreSession};

/// 一次获取中，没有拿到任何触发器时最多重新查询的次数
const MAX_ACQUIRE_LOOPS: usize = 3;

impl SqlJobStore {
    pub(super) async fn acquire_next_triggers_in(
        &self,
        session: &mut StoreSession,
        no_later_than: DateTime<Utc>,
        max_count: usize,
        time_window: Duration,
    ) -> SchedulerResult<Vec<Trigger>> {
        let max_count = max_count.max(1);
        let mut acquired: Vec<Trigger> = Vec::new();
        let mut acquired_jobs: HashSet<JobKey> = HashSet::new();

        for _ in 0..MAX_ACQUIRE_LOOPS {
            let now = now_millis();
            let mut batch_end = no_later_than;
            let candidates = self
                .delegate
                .select_triggers_to_acquire(
                    session.conn(),
                    no_later_than + time_window,
                    now - self.options.misfire_threshold,
                    max_count,
                )
                .await?;
            if candidates.is_empty() {
                break;
            }

            let mut batch_end_reached = false;
            for mut candidate in candidates {
                if acquired.len() >= max_count {
                    break;
                }
                let Some(next_fire_time) = candidate.next_fire_time else {
                    continue;
                };
                if next_fire_time > batch_end {
                    batch_end_reached = true;
                    break;
                }

                let conn = session.conn();
                let Some(job) = self.delegate.select_job(conn, &candidate.job_key).await? else {
                    warn!(
                        trigger = %candidate.key,
                        job = %candidate.job_key,
                        "触发器引用的作业不存在，标记为 ERROR"
                    );
                    self.delegate
                        .update_trigger_state(conn, &candidate.key, TriggerState::Error)
                        .await?;
                    continue;
                };

                if job.concurrent_execution_disallowed {
                    if acquired_jobs.contains(&job.key) {
                        continue;
                    }
                    if self.delegate.count_fired_triggers_for_job(conn, &job.key).await? > 0 {
                        self.delegate
                            .update_trigger_state_from(
                                conn,
                                &candidate.key,
                                TriggerState::Blocked,
                                &[TriggerState::Waiting],
                            )
                            .await?;
                        debug!(trigger = %candidate.key, "作业正在执行，触发器转为 BLOCKED");
                        continue;
                    }
                }

                let updated = self
                    .delegate
                    .update_trigger_state_from(
                        conn,
                        &candidate.key,
                        TriggerState::Acquired,
                        &[TriggerState::Waiting],
                    )
                    .await?;
                if updated == 0 {
                    continue;
                }

                let fire_instance_id = Uuid::new_v4().to_string();
                let record = new_fired_record(
                    fire_instance_id.clone(),
                    &candidate,
                    Some(&job),
                    &self.options.instance_id,
                    now,
                    next_fire_time,
                    FiredTriggerState::Acquired,
                );
                self.delegate.insert_fired_trigger(conn, &record).await?;

                if acquired.is_empty() {
                    batch_end = next_fire_time.max(now) + time_window;
                }
                if job.concurrent_execution_disallowed {
                    acquired_jobs.insert(job.key.clone());
                }
                candidate.state = TriggerState::Acquired;
                candidate.fire_instance_id = Some(fire_instance_id);
                acquired.push(candidate);
            }

            if batch_end_reached || !acquired.is_empty() {
                break;
            }
        }

        if !acquired.is_empty() {
            debug!(count = acquired.len(), "已获取待触发的触发器");
        }
        Ok(acquired)
    }

    pub(super) async fn release_acquired_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        self.delegate
            .update_trigger_state_from(
                conn,
                &trigger.key,
                TriggerState::Waiting,
                &[TriggerState::Acquired, TriggerState::Blocked],
            )
            .await?;
        if let Some(fire_instance_id) = trigger.fire_instance_id.as_deref() {
            self.delegate.delete_fired_trigger(conn, fire_instance_id).await?;
        }
        debug!(trigger = %trigger.key, "已释放获取的触发器");
        Ok(())
    }

    pub(super) async fn triggers_fired_in(
        &self,
        session: &mut StoreSession,
        triggers: &[Trigger],
    ) -> SchedulerResult<Vec<TriggerFiredResult>> {
        let mut results = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            if let Some(result) = self.trigger_fired_in(session, trigger).await? {
                results.push(result);
            }
        }
        Ok(results)
    }

    /// 确认单个触发器；竞争失败（状态已不是 ACQUIRED）或日历缺失时返回 None
    async fn trigger_fired_in(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
    ) -> SchedulerResult<Option<TriggerFiredResult>> {
        let Some(fire_instance_id) = trigger.fire_instance_id.clone() else {
            return Ok(Some(TriggerFiredResult::Failed {
                trigger: Box::new(trigger.clone()),
                error: SchedulerError::Internal(format!("触发器 {} 没有经过获取", trigger.key)),
            }));
        };
        let conn = session.conn();

        let state = self.delegate.select_trigger_state(conn, &trigger.key).await?;
        if state != Some(TriggerState::Acquired) {
            debug!(trigger = %trigger.key, state = ?state, "触发器已不是 ACQUIRED，放弃本次触发");
            self.delegate.delete_fired_trigger(conn, &fire_instance_id).await?;
            return Ok(None);
        }

        let Some(job) = self.delegate.select_job(conn, &trigger.job_key).await? else {
            warn!(trigger = %trigger.key, job = %trigger.job_key, "触发时作业不存在");
            self.delegate
                .update_trigger_state(conn, &trigger.key, TriggerState::Error)
                .await?;
            self.delegate.delete_fired_trigger(conn, &fire_instance_id).await?;
            return Ok(Some(TriggerFiredResult::Failed {
                trigger: Box::new(trigger.clone()),
                error: SchedulerError::job_not_found(trigger.job_key.to_string()),
            }));
        };

        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => match self.delegate.select_calendar(conn, name).await? {
                Some(calendar) => Some(calendar),
                None => {
                    warn!(trigger = %trigger.key, calendar = name, "触发器引用的日历不存在");
                    self.delegate
                        .update_trigger_state_from(
                            conn,
                            &trigger.key,
                            TriggerState::Waiting,
                            &[TriggerState::Acquired],
                        )
                        .await?;
                    self.delegate.delete_fired_trigger(conn, &fire_instance_id).await?;
                    return Ok(None);
                }
            },
            None => None,
        };

        // 以数据库中的最新版本为准
        let Some(mut current) = self.delegate.select_trigger(conn, &trigger.key).await? else {
            self.delegate.delete_fired_trigger(conn, &fire_instance_id).await?;
            return Ok(None);
        };

        let now = now_millis();
        let scheduled_fire_time = current.next_fire_time;
        let previous_fire_time = current.previous_fire_time;
        let record = new_fired_record(
            fire_instance_id.clone(),
            &current,
            Some(&job),
            &self.options.instance_id,
            now,
            scheduled_fire_time.unwrap_or(now),
            FiredTriggerState::Executing,
        );
        self.delegate.update_fired_trigger(conn, &record).await?;

        current.triggered(calendar.as_ref());

        if job.concurrent_execution_disallowed {
            self.delegate
                .update_job_triggers_state_from(
                    conn,
                    &job.key,
                    TriggerState::Blocked,
                    &[TriggerState::Waiting, TriggerState::Acquired],
                )
                .await?;
            self.delegate
                .update_job_triggers_state_from(
                    conn,
                    &job.key,
                    TriggerState::PausedBlocked,
                    &[TriggerState::Paused],
                )
                .await?;
        }

        // 触发器保持 EXECUTING，直到执行完成
        self.delegate
            .update_trigger(conn, &current, TriggerState::Executing)
            .await?;
        current.state = TriggerState::Executing;
        current.fire_instance_id = Some(fire_instance_id.clone());

        let recovering = current.key.group == RECOVERING_JOBS_GROUP;
        let next_fire_time = current.next_fire_time;
        Ok(Some(TriggerFiredResult::Fired(Box::new(TriggerFiredBundle {
            job,
            trigger: current,
            calendar,
            recovering,
            fire_time: now,
            scheduled_fire_time,
            previous_fire_time,
            next_fire_time,
            fire_instance_id,
        }))))
    }

    pub(super) async fn triggered_job_complete_in(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
        job: &JobDetail,
        instruction: CompletedExecutionInstruction,
    ) -> SchedulerResult<bool> {
        let Some(fire_instance_id) = trigger.fire_instance_id.as_deref() else {
            warn!(trigger = %trigger.key, "完成通知缺少触发实例编号，忽略");
            return Ok(false);
        };
        if self
            .delegate
            .delete_fired_trigger(session.conn(), fire_instance_id)
            .await?
            == 0
        {
            debug!(
                trigger = %trigger.key,
                fire_instance_id,
                "已触发记录不存在，重复的完成通知被忽略"
            );
            return Ok(false);
        }

        match instruction {
            CompletedExecutionInstruction::DeleteTrigger => {
                self.complete_with_delete(session, trigger).await?;
            }
            CompletedExecutionInstruction::SetTriggerComplete => {
                self.delegate
                    .update_trigger_state(session.conn(), &trigger.key, TriggerState::Complete)
                    .await?;
                session.events.finalized(trigger.clone());
                session.events.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetTriggerError => {
                info!(trigger = %trigger.key, "触发器被设置为 ERROR");
                self.delegate
                    .update_trigger_state(session.conn(), &trigger.key, TriggerState::Error)
                    .await?;
                session.events.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersComplete => {
                self.delegate
                    .update_job_triggers_state(session.conn(), &job.key, TriggerState::Complete)
                    .await?;
                session.events.finalized(trigger.clone());
                session.events.scheduling_change(None);
            }
            CompletedExecutionInstruction::SetAllJobTriggersError => {
                info!(job = %job.key, "作业的全部触发器被设置为 ERROR");
                self.delegate
                    .update_job_triggers_state(session.conn(), &job.key, TriggerState::Error)
                    .await?;
                session.events.scheduling_change(None);
            }
            CompletedExecutionInstruction::Noop | CompletedExecutionInstruction::ReExecuteJob => {
                self.release_executing_trigger(session, trigger).await?;
            }
        }

        let conn = session.conn();
        if job.concurrent_execution_disallowed
            && self.delegate.count_fired_triggers_for_job(conn, &job.key).await? == 0
        {
            self.delegate
                .update_job_triggers_state_from(
                    conn,
                    &job.key,
                    TriggerState::Waiting,
                    &[TriggerState::Blocked],
                )
                .await?;
            self.delegate
                .update_job_triggers_state_from(
                    conn,
                    &job.key,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )
                .await?;
            session.events.scheduling_change(None);
        }

        if job.persist_job_data_after_execution {
            self.delegate
                .update_job_data(session.conn(), &job.key, &job.job_data)
                .await?;
        }

        debug!(trigger = %trigger.key, %instruction, "已完成执行");
        Ok(true)
    }

    /// 删除不再触发的触发器；执行期间被重新调度（存储中仍有下一次触发时间）时只释放
    async fn complete_with_delete(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let stored = self
            .delegate
            .select_trigger(session.conn(), &trigger.key)
            .await?;
        let Some(stored) = stored else {
            return Ok(());
        };
        if trigger.next_fire_time.is_none() && stored.next_fire_time.is_some() {
            return self.release_executing_trigger(session, trigger).await;
        }
        if let Some(removed) = self.remove_trigger_in(session, &trigger.key).await? {
            session.events.finalized(removed);
        }
        session.events.scheduling_change(None);
        Ok(())
    }

    /// EXECUTING 的触发器回到 WAITING；没有下一次触发时间时转为 COMPLETE。暂停的保持暂停
    async fn release_executing_trigger(
        &self,
        session: &mut StoreSession,
        trigger: &Trigger,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        let Some(stored) = self.delegate.select_trigger(conn, &trigger.key).await? else {
            return Ok(());
        };
        if stored.state != TriggerState::Executing {
            return Ok(());
        }
        if stored.next_fire_time.is_some() {
            self.delegate
                .update_trigger_state_from(
                    conn,
                    &trigger.key,
                    TriggerState::Waiting,
                    &[TriggerState::Executing],
                )
                .await?;
            session.events.scheduling_change(stored.next_fire_time);
        } else {
            self.delegate
                .update_trigger_state_from(
                    conn,
                    &trigger.key,
                    TriggerState::Complete,
                    &[TriggerState::Executing],
                )
                .await?;
            session.events.finalized(stored);
        }
        Ok(())
    }
}
