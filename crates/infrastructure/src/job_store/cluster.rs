//! 集群心跳、失联实例恢复以及非集群启动时的状态修复

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scheduler_domain::{
    now_millis, FiredTriggerRecord, FiredTriggerState, MisfireInstruction, RecoveryReport,
    Schedule, SchedulerStateRecord, Trigger, TriggerKey, TriggerState, RECOVERING_JOBS_GROUP,
    RECOVERY_ORIGINAL_FIRE_TIME_MS, RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME_MS,
    RECOVERY_ORIGINAL_TRIGGER_GROUP, RECOVERY_ORIGINAL_TRIGGER_NAME,
};
use scheduler_errors::SchedulerResult;

use super::{in_session, SqlJobStore, StoreSession};
use crate::locks::{STATE_ACCESS, TRIGGER_ACCESS};

/// 判断失联时在心跳间隔之外额外容忍的时长
pub const CHECKIN_GRACE_MS: i64 = 7_500;

impl SqlJobStore {
    /// 心跳：非首次先不加锁检查，发现失联实例（或首次心跳）时再加锁确认并恢复
    pub(super) async fn do_check_in(&self) -> SchedulerResult<RecoveryReport> {
        if !self.options.clustered {
            return Ok(RecoveryReport::default());
        }
        let first = self.first_checkin.load(Ordering::SeqCst);

        let mut failed_found = first;
        if !first {
            let failed = in_session!(self, "cluster_check_in", &[], |session| self
                .cluster_check_in_in(&mut session, false))?;
            failed_found = !failed.is_empty();
        }

        let mut report = RecoveryReport::default();
        if failed_found {
            report = in_session!(self, "cluster_recover", &[STATE_ACCESS], |session| self
                .check_in_and_recover_in(&mut session, first))?;
        }
        self.first_checkin.store(false, Ordering::SeqCst);

        if !report.failed_instances.is_empty() {
            info!(
                failed_instances = ?report.failed_instances,
                recovered = report.recovered_records,
                recovery_triggers = report.recovery_triggers_created,
                "已恢复失联实例的执行"
            );
            self.metrics.record_recovered(report.recovered_records);
        }
        Ok(report)
    }

    /// 持有 STATE_ACCESS：重新确认失联实例，需要恢复时再获取 TRIGGER_ACCESS
    async fn check_in_and_recover_in(
        &self,
        session: &mut StoreSession,
        first: bool,
    ) -> SchedulerResult<RecoveryReport> {
        let failed = self.cluster_check_in_in(session, first).await?;
        if failed.is_empty() {
            return Ok(RecoveryReport::default());
        }
        self.obtain_lock(session, TRIGGER_ACCESS).await?;
        self.cluster_recover_in(session, &failed).await
    }

    /// 找出失联实例并写入本实例的心跳
    async fn cluster_check_in_in(
        &self,
        session: &mut StoreSession,
        first: bool,
    ) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        let failed = self.find_failed_instances(session, first).await?;
        let now = now_millis();
        self.delegate
            .upsert_scheduler_state(
                session.conn(),
                &self.options.instance_id,
                now,
                i64::try_from(self.options.cluster_checkin_interval.as_millis()).unwrap_or(i64::MAX),
            )
            .await?;
        self.last_checkin_ms
            .store(now.timestamp_millis(), Ordering::SeqCst);
        Ok(failed)
    }

    async fn find_failed_instances(
        &self,
        session: &mut StoreSession,
        first: bool,
    ) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        let conn = session.conn();
        let states = self.delegate.select_scheduler_states(conn).await?;
        let now = now_millis();
        let own_last_checkin = self.last_checkin();

        let mut failed = Vec::new();
        let mut found_self = false;
        for state in &states {
            if state.instance_id == self.options.instance_id {
                found_self = true;
                // 首次心跳时，同名的旧记录属于上一次运行
                if first {
                    failed.push(state.clone());
                }
            } else if state.has_failed(now, own_last_checkin, CHECKIN_GRACE_MS) {
                failed.push(state.clone());
            }
        }

        if first {
            // 只有已触发记录、没有心跳记录的实例
            let known: HashSet<&str> = states.iter().map(|s| s.instance_id.as_str()).collect();
            for instance_id in self.delegate.select_fired_trigger_instance_ids(conn).await? {
                if !known.contains(instance_id.as_str()) {
                    debug!(instance_id = %instance_id, "发现没有心跳记录的已触发记录");
                    failed.push(SchedulerStateRecord {
                        instance_id,
                        last_checkin_time: DateTime::<Utc>::UNIX_EPOCH,
                        checkin_interval_ms: 0,
                    });
                }
            }
        } else if !found_self {
            warn!(
                instance_id = %self.options.instance_id,
                "本实例仍在运行，但心跳记录已被其他实例当作失联清除"
            );
        }
        Ok(failed)
    }

    /// 恢复失联实例遗留的已触发记录
    async fn cluster_recover_in(
        &self,
        session: &mut StoreSession,
        failed: &[SchedulerStateRecord],
    ) -> SchedulerResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for instance in failed {
            info!(instance_id = %instance.instance_id, "正在恢复失联实例");
            let records = self
                .delegate
                .select_fired_triggers_for_instance(session.conn(), &instance.instance_id)
                .await?;

            let mut acquired = 0usize;
            let mut recovered = 0usize;
            let mut other = 0usize;
            for record in &records {
                match record.state {
                    FiredTriggerState::Acquired => {
                        self.delegate
                            .update_trigger_state_from(
                                session.conn(),
                                &record.trigger_key,
                                TriggerState::Waiting,
                                &[TriggerState::Acquired],
                            )
                            .await?;
                        acquired += 1;
                    }
                    FiredTriggerState::Executing => {
                        if self.recover_execution(session, record).await? {
                            recovered += 1;
                        } else {
                            other += 1;
                        }
                        self.release_orphaned_trigger(session, &record.trigger_key)
                            .await?;
                    }
                }
                if record.concurrent_execution_disallowed {
                    self.unblock_job_triggers(session, record).await?;
                }
            }

            let conn = session.conn();
            self.delegate
                .delete_fired_triggers_for_instance(conn, &instance.instance_id)
                .await?;
            if instance.instance_id != self.options.instance_id {
                self.delegate
                    .delete_scheduler_state(conn, &instance.instance_id)
                    .await?;
            }

            info!(
                instance_id = %instance.instance_id,
                acquired,
                recovered,
                other,
                "失联实例恢复完成"
            );
            report.failed_instances.push(instance.instance_id.clone());
            report.recovered_records += records.len();
            report.recovery_triggers_created += recovered;
        }

        if report.recovered_records > 0 {
            session.events.scheduling_change(None);
        }
        Ok(report)
    }

    /// 为请求恢复的作业创建一次性恢复触发器；作业已不存在或未请求恢复时返回 false
    async fn recover_execution(
        &self,
        session: &mut StoreSession,
        record: &FiredTriggerRecord,
    ) -> SchedulerResult<bool> {
        if !record.requests_recovery {
            return Ok(false);
        }
        let conn = session.conn();
        if !self.delegate.job_exists(conn, &record.job_key).await? {
            warn!(
                job = %record.job_key,
                trigger = %record.trigger_key,
                "作业已不存在，跳过恢复"
            );
            return Ok(false);
        }

        let original = self
            .delegate
            .select_trigger(conn, &record.trigger_key)
            .await?;
        let mut recovery = Trigger::new(
            TriggerKey::new(
                format!("recover_{}_{}", record.instance_id, Uuid::new_v4().simple()),
                RECOVERING_JOBS_GROUP,
            ),
            record.job_key.clone(),
            Schedule::once(),
        )
        .with_start_time(record.scheduled_at)
        .with_priority(record.priority)
        .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy);
        if let Some(original) = original {
            recovery.job_data = original.job_data;
        }
        recovery.job_data.insert(
            RECOVERY_ORIGINAL_TRIGGER_NAME.to_string(),
            Value::from(record.trigger_key.name.clone()),
        );
        recovery.job_data.insert(
            RECOVERY_ORIGINAL_TRIGGER_GROUP.to_string(),
            Value::from(record.trigger_key.group.clone()),
        );
        recovery.job_data.insert(
            RECOVERY_ORIGINAL_FIRE_TIME_MS.to_string(),
            Value::from(record.fired_at.timestamp_millis()),
        );
        recovery.job_data.insert(
            RECOVERY_ORIGINAL_SCHEDULED_FIRE_TIME_MS.to_string(),
            Value::from(record.scheduled_at.timestamp_millis()),
        );
        recovery.compute_first_fire_time(None);

        self.store_trigger_in(session, &recovery, false, TriggerState::Waiting, false, true)
            .await?;
        info!(
            trigger = %recovery.key,
            job = %record.job_key,
            "已为中断的执行创建恢复触发器"
        );
        Ok(true)
    }

    /// 仍处于 EXECUTING 的原触发器回到 WAITING；不会再触发的直接删除
    async fn release_orphaned_trigger(
        &self,
        session: &mut StoreSession,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        let Some(trigger) = self
            .delegate
            .select_trigger(session.conn(), trigger_key)
            .await?
        else {
            return Ok(());
        };
        if trigger.state != TriggerState::Executing {
            return Ok(());
        }
        if trigger.next_fire_time.is_some() {
            self.delegate
                .update_trigger_state_from(
                    session.conn(),
                    trigger_key,
                    TriggerState::Waiting,
                    &[TriggerState::Executing],
                )
                .await?;
        } else if let Some(removed) = self.remove_trigger_in(session, trigger_key).await? {
            session.events.finalized(removed);
        }
        Ok(())
    }

    async fn unblock_job_triggers(
        &self,
        session: &mut StoreSession,
        record: &FiredTriggerRecord,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        self.delegate
            .update_job_triggers_state_from(
                conn,
                &record.job_key,
                TriggerState::Waiting,
                &[TriggerState::Blocked],
            )
            .await?;
        self.delegate
            .update_job_triggers_state_from(
                conn,
                &record.job_key,
                TriggerState::Paused,
                &[TriggerState::PausedBlocked],
            )
            .await?;
        Ok(())
    }

    /// 非集群模式启动：修复上次运行遗留的中间状态
    pub(super) async fn recover_jobs(&self) -> SchedulerResult<()> {
        in_session!(self, "recover_jobs", &[TRIGGER_ACCESS], |session| self
            .recover_jobs_in(&mut session))
    }

    async fn recover_jobs_in(&self, session: &mut StoreSession) -> SchedulerResult<()> {
        let conn = session.conn();
        let released = self
            .delegate
            .update_all_triggers_state_from(
                conn,
                TriggerState::Waiting,
                &[
                    TriggerState::Acquired,
                    TriggerState::Blocked,
                    TriggerState::Executing,
                ],
            )
            .await?;
        let released = released
            + self
                .delegate
                .update_all_triggers_state_from(
                    conn,
                    TriggerState::Paused,
                    &[TriggerState::PausedBlocked],
                )
                .await?;
        self.delegate
            .complete_triggers_without_next_fire_time(conn, TriggerState::Waiting)
            .await?;
        info!(released, "已把上次运行遗留的触发器恢复为可触发状态");

        let records = self.delegate.select_all_fired_triggers(conn).await?;
        let mut recovered = 0usize;
        for record in &records {
            if record.state == FiredTriggerState::Executing
                && self.recover_execution(session, record).await?
            {
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "已为需要恢复的作业创建恢复触发器");
        }

        let misfires = self.recover_misfired_in(session, true, None).await?;
        if misfires.processed > 0 {
            info!(processed = misfires.processed, "已处理启动前错过的触发");
            self.metrics.record_misfires_handled(misfires.processed);
        }

        let completed = self
            .delegate
            .select_trigger_keys_in_state(session.conn(), TriggerState::Complete)
            .await?;
        for key in &completed {
            self.remove_trigger_in(session, key).await?;
        }
        if !completed.is_empty() {
            info!(count = completed.len(), "已清除已完成的触发器");
        }

        let deleted = self.delegate.delete_all_fired_triggers(session.conn()).await?;
        debug!(deleted, "已清除遗留的已触发记录");
        session.events.scheduling_change(None);
        Ok(())
    }
}
