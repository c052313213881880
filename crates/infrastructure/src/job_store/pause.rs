//! 暂停与恢复

use tracing::debug;

use scheduler_domain::{now_millis, FiredTriggerState, JobKey, TriggerKey, TriggerState};
use scheduler_errors::SchedulerResult;

use super::delegate::ALL_GROUPS_PAUSED;
use super::{SqlJobStore, StoreSession};

const PAUSABLE: &[TriggerState] = &[
    TriggerState::Waiting,
    TriggerState::Acquired,
    TriggerState::Executing,
];

impl SqlJobStore {
    pub(super) async fn pause_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        self.delegate
            .update_trigger_state_from(conn, trigger_key, TriggerState::Paused, PAUSABLE)
            .await?;
        self.delegate
            .update_trigger_state_from(
                conn,
                trigger_key,
                TriggerState::PausedBlocked,
                &[TriggerState::Blocked],
            )
            .await?;
        debug!(trigger = %trigger_key, "触发器已暂停");
        Ok(())
    }

    /// 恢复触发器：仍在执行的回到 EXECUTING，作业被占用的回到 BLOCKED，否则回到 WAITING；
    /// 下一次触发时间已超过补火阈值的按补火策略处理
    pub(super) async fn resume_trigger_in(
        &self,
        session: &mut StoreSession,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        let Some(trigger) = self.delegate.select_trigger(conn, trigger_key).await? else {
            return Ok(());
        };
        if !trigger.state.is_paused() {
            return Ok(());
        }

        let executing = self
            .delegate
            .select_fired_triggers_for_trigger(conn, trigger_key)
            .await?
            .iter()
            .any(|r| r.state == FiredTriggerState::Executing);
        let new_state = if executing {
            TriggerState::Executing
        } else {
            self.check_blocked_state(conn, &trigger.job_key, TriggerState::Waiting)
                .await?
        };

        let misfire_time = now_millis() - self.options.misfire_threshold;
        let misfired = new_state == TriggerState::Waiting
            && trigger.next_fire_time.is_some_and(|next| next < misfire_time);
        if misfired {
            self.update_misfired_trigger(session, trigger, TriggerState::Waiting, true, false)
                .await?;
        } else {
            self.delegate
                .update_trigger_state_from(
                    conn,
                    trigger_key,
                    new_state,
                    &[TriggerState::Paused, TriggerState::PausedBlocked],
                )
                .await?;
            session.events.scheduling_change(trigger.next_fire_time);
        }
        debug!(trigger = %trigger_key, state = %new_state, misfired, "触发器已恢复");
        Ok(())
    }

    pub(super) async fn pause_job_in(
        &self,
        session: &mut StoreSession,
        job_key: &JobKey,
    ) -> SchedulerResult<()> {
        let triggers = self
            .delegate
            .select_triggers_for_job(session.conn(), job_key)
            .await?;
        for trigger in triggers {
            self.pause_trigger_in(session, &trigger.key).await?;
        }
        Ok(())
    }

    pub(super) async fn resume_job_in(
        &self,
        session: &mut StoreSession,
        job_key: &JobKey,
    ) -> SchedulerResult<()> {
        let triggers = self
            .delegate
            .select_triggers_for_job(session.conn(), job_key)
            .await?;
        for trigger in triggers {
            self.resume_trigger_in(session, &trigger.key).await?;
        }
        Ok(())
    }

    pub(super) async fn pause_trigger_group_in(
        &self,
        session: &mut StoreSession,
        group: &str,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        self.delegate
            .update_trigger_group_state_from(conn, group, TriggerState::Paused, PAUSABLE)
            .await?;
        self.delegate
            .update_trigger_group_state_from(
                conn,
                group,
                TriggerState::PausedBlocked,
                &[TriggerState::Blocked],
            )
            .await?;
        self.delegate.insert_paused_trigger_group(conn, group).await?;
        debug!(group, "触发器分组已暂停");
        Ok(())
    }

    pub(super) async fn resume_trigger_group_in(
        &self,
        session: &mut StoreSession,
        group: &str,
    ) -> SchedulerResult<()> {
        let conn = session.conn();
        self.delegate.delete_paused_trigger_group(conn, group).await?;
        let keys = self
            .delegate
            .select_trigger_keys_in_group(conn, group)
            .await?;
        for key in keys {
            self.resume_trigger_in(session, &key).await?;
        }
        debug!(group, "触发器分组已恢复");
        Ok(())
    }

    pub(super) async fn pause_job_group_in(
        &self,
        session: &mut StoreSession,
        group: &str,
    ) -> SchedulerResult<()> {
        let jobs = self
            .delegate
            .select_job_keys(session.conn(), Some(group))
            .await?;
        for job_key in jobs {
            self.pause_job_in(session, &job_key).await?;
        }
        Ok(())
    }

    pub(super) async fn resume_job_group_in(
        &self,
        session: &mut StoreSession,
        group: &str,
    ) -> SchedulerResult<()> {
        let jobs = self
            .delegate
            .select_job_keys(session.conn(), Some(group))
            .await?;
        for job_key in jobs {
            self.resume_job_in(session, &job_key).await?;
        }
        Ok(())
    }

    pub(super) async fn pause_all_in(&self, session: &mut StoreSession) -> SchedulerResult<()> {
        let groups = self.delegate.select_trigger_groups(session.conn()).await?;
        for group in groups {
            self.pause_trigger_group_in(session, &group).await?;
        }
        self.delegate
            .insert_paused_trigger_group(session.conn(), ALL_GROUPS_PAUSED)
            .await?;
        Ok(())
    }

    pub(super) async fn resume_all_in(&self, session: &mut StoreSession) -> SchedulerResult<()> {
        let groups = self.delegate.select_trigger_groups(session.conn()).await?;
        for group in groups {
            self.resume_trigger_group_in(session, &group).await?;
        }
        self.delegate
            .delete_all_paused_trigger_groups(session.conn())
            .await?;
        Ok(())
    }
}
