//! 错过触发的扫描与处理

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use scheduler_domain::{now_millis, MisfireScanResult, Trigger, TriggerState};
use scheduler_errors::SchedulerResult;

use super::{in_session, SqlJobStore, StoreSession};
use crate::locks::TRIGGER_ACCESS;

impl SqlJobStore {
    /// 先不加锁统计，确实有错过的触发器时才获取锁处理
    pub(super) async fn do_recover_misfires(&self) -> SchedulerResult<MisfireScanResult> {
        let misfire_time = now_millis() - self.options.misfire_threshold;
        let count = in_session!(self, "count_misfired_triggers", &[], |session| self
            .delegate
            .count_misfired_triggers_in_state(session.conn(), TriggerState::Waiting, misfire_time))?;
        if count == 0 {
            debug!("没有错过触发的触发器");
            return Ok(MisfireScanResult::default());
        }

        let limit = self.options.max_misfires_to_handle_at_a_time;
        let result = in_session!(self, "recover_misfired_triggers", &[TRIGGER_ACCESS], |session| self
            .recover_misfired_in(&mut session, false, Some(limit)))?;
        if result.processed > 0 {
            info!(
                processed = result.processed,
                has_more = result.has_more,
                "已处理错过触发的触发器"
            );
            self.metrics.record_misfires_handled(result.processed);
        }
        Ok(result)
    }

    /// 处理 WAITING 且下一次触发时间早于 `now - 阈值` 的触发器；`limit` 为 None 时全部处理
    pub(super) async fn recover_misfired_in(
        &self,
        session: &mut StoreSession,
        recovering: bool,
        limit: Option<usize>,
    ) -> SchedulerResult<MisfireScanResult> {
        let misfire_time = now_millis() - self.options.misfire_threshold;
        let mut triggers = self
            .delegate
            .select_misfired_triggers_in_state(
                session.conn(),
                TriggerState::Waiting,
                misfire_time,
                limit.map(|l| l + 1),
            )
            .await?;

        let has_more = match limit {
            Some(limit) if triggers.len() > limit => {
                triggers.truncate(limit);
                true
            }
            _ => false,
        };

        let mut earliest_new_time: Option<DateTime<Utc>> = None;
        let processed = triggers.len();
        for trigger in triggers {
            let next = self
                .update_misfired_trigger(session, trigger, TriggerState::Waiting, false, recovering)
                .await?;
            if let Some(next) = next {
                earliest_new_time = Some(earliest_new_time.map_or(next, |e| e.min(next)));
            }
        }

        if processed > 0 {
            session.events.scheduling_change(earliest_new_time);
        }
        Ok(MisfireScanResult {
            processed,
            has_more,
            earliest_new_time,
        })
    }

    /// 通知监听器并按补火策略更新触发器；不会再触发的转为 COMPLETE。返回新的下一次触发时间
    pub(super) async fn update_misfired_trigger(
        &self,
        session: &mut StoreSession,
        mut trigger: Trigger,
        new_state_if_not_complete: TriggerState,
        force_state: bool,
        recovering: bool,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let calendar = match trigger.calendar_name.as_deref() {
            Some(name) => self.delegate.select_calendar(session.conn(), name).await?,
            None => None,
        };

        session.events.misfired(trigger.clone());
        let missed = trigger.next_fire_time;
        trigger.update_after_misfire(calendar.as_ref(), now_millis());
        debug!(
            trigger = %trigger.key,
            instruction = %trigger.misfire_instruction,
            missed = ?missed,
            next = ?trigger.next_fire_time,
            "按补火策略处理错过的触发"
        );

        if trigger.next_fire_time.is_none() {
            self.store_trigger_in(session, &trigger, true, TriggerState::Complete, true, recovering)
                .await?;
            session.events.finalized(trigger);
            Ok(None)
        } else {
            self.store_trigger_in(
                session,
                &trigger,
                true,
                new_state_if_not_complete,
                force_state,
                recovering,
            )
            .await?;
            Ok(trigger.next_fire_time)
        }
    }
}
