use chrono::{DateTime, Datelike, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::calendar::Calendar;
use crate::entities::TriggerState;
use crate::instruction::CompletedExecutionInstruction;
use crate::job::JobExecutionError;
use crate::misfire::MisfireInstruction;
use crate::schedule::{Schedule, REPEAT_INDEFINITELY, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::value_objects::{now_millis, truncate_to_millis, JobDataMap, JobKey, TriggerKey};
use scheduler_errors::{SchedulerError, SchedulerResult};

pub const DEFAULT_PRIORITY: i32 = 5;

/// 触发器：绑定到作业的调度规则，以及它自己的触发状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub key: TriggerKey,
    pub job_key: JobKey,
    pub description: Option<String>,
    pub calendar_name: Option<String>,
    #[serde(default)]
    pub job_data: JobDataMap,
    pub priority: i32,
    pub misfire_instruction: MisfireInstruction,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub schedule: Schedule,
    pub next_fire_time: Option<DateTime<Utc>>,
    pub previous_fire_time: Option<DateTime<Utc>>,
    pub times_triggered: i32,
    pub state: TriggerState,
    /// 获取后由存储层填充，仅在一次触发过程中有效
    #[serde(skip)]
    pub fire_instance_id: Option<String>,
}

impl Trigger {
    pub fn new(key: TriggerKey, job_key: JobKey, schedule: Schedule) -> Self {
        Self {
            key,
            job_key,
            description: None,
            calendar_name: None,
            job_data: JobDataMap::new(),
            priority: DEFAULT_PRIORITY,
            misfire_instruction: MisfireInstruction::Smart,
            start_time: now_millis(),
            end_time: None,
            schedule,
            next_fire_time: None,
            previous_fire_time: None,
            times_triggered: 0,
            state: TriggerState::Waiting,
            fire_instance_id: None,
        }
    }

    pub fn with_start_time(mut self, start_time: DateTime<Utc>) -> Self {
        self.start_time = truncate_to_millis(start_time);
        self
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(truncate_to_millis(end_time));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_misfire_instruction(mut self, instruction: MisfireInstruction) -> Self {
        self.misfire_instruction = instruction;
        self
    }

    pub fn with_calendar(mut self, calendar_name: impl Into<String>) -> Self {
        self.calendar_name = Some(calendar_name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.job_data.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.key.name.trim().is_empty() || self.key.group.trim().is_empty() {
            return Err(SchedulerError::validation_error("触发器名称和分组不能为空"));
        }
        if self.job_key.name.trim().is_empty() || self.job_key.group.trim().is_empty() {
            return Err(SchedulerError::validation_error(format!(
                "触发器 {} 未关联作业",
                self.key
            )));
        }
        if let Some(end) = self.end_time {
            if end < self.start_time {
                return Err(SchedulerError::invalid_schedule(format!(
                    "触发器 {} 的结束时间早于开始时间",
                    self.key
                )));
            }
        }
        self.schedule.validate()?;
        if !self.misfire_instruction.is_valid_for(self.schedule.kind()) {
            return Err(SchedulerError::invalid_schedule(format!(
                "补火策略 {} 不适用于 {} 触发器",
                self.misfire_instruction,
                self.schedule.kind()
            )));
        }
        Ok(())
    }

    /// 不考虑日历，严格晚于 `after` 的下一次触发时间
    pub fn fire_time_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .fire_time_after(self.start_time, self.end_time, self.times_triggered, after)
    }

    pub fn final_fire_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.final_fire_time(self.start_time, self.end_time)
    }

    pub fn may_fire_again(&self) -> bool {
        self.next_fire_time.is_some()
    }

    /// 计算首次触发时间并写入 next_fire_time
    pub fn compute_first_fire_time(&mut self, calendar: Option<&Calendar>) -> Option<DateTime<Utc>> {
        let first = compute_next_fire_time(
            self,
            calendar,
            self.start_time - Duration::milliseconds(1),
        );
        self.next_fire_time = first;
        first
    }

    /// 触发后推进：记录本次触发并计算下一次
    pub fn triggered(&mut self, calendar: Option<&Calendar>) {
        self.times_triggered = self.times_triggered.saturating_add(1);
        self.previous_fire_time = self.next_fire_time;
        self.next_fire_time = match self.next_fire_time {
            Some(current) => compute_next_fire_time(self, calendar, current),
            None => None,
        };
    }

    /// 按补火策略修正错过的触发时间
    pub fn update_after_misfire(&mut self, calendar: Option<&Calendar>, now: DateTime<Utc>) {
        let mut instruction = self.misfire_instruction;
        if instruction == MisfireInstruction::IgnoreMisfirePolicy {
            return;
        }
        match self.schedule {
            Schedule::Simple { repeat_count, .. } => {
                if instruction == MisfireInstruction::Smart {
                    instruction = if repeat_count == 0 {
                        MisfireInstruction::FireNow
                    } else if repeat_count == REPEAT_INDEFINITELY {
                        MisfireInstruction::RescheduleNextWithRemainingCount
                    } else {
                        MisfireInstruction::RescheduleNowWithExistingRepeatCount
                    };
                } else if instruction == MisfireInstruction::FireNow && repeat_count != 0 {
                    instruction = MisfireInstruction::RescheduleNowWithRemainingRepeatCount;
                }
                self.apply_simple_misfire(instruction, calendar, now);
            }
            Schedule::Cron { .. } | Schedule::CalendarInterval { .. } => match instruction {
                MisfireInstruction::DoNothing => {
                    self.next_fire_time = compute_next_fire_time(self, calendar, now);
                }
                _ => {
                    self.next_fire_time = Some(now);
                }
            },
        }
    }

    fn apply_simple_misfire(
        &mut self,
        instruction: MisfireInstruction,
        calendar: Option<&Calendar>,
        now: DateTime<Utc>,
    ) {
        match instruction {
            MisfireInstruction::RescheduleNextWithExistingCount => {
                self.next_fire_time = compute_next_fire_time(self, calendar, now);
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                let new_time = compute_next_fire_time(self, calendar, now);
                if let (Some(new_time), Some(old_time)) = (new_time, self.next_fire_time) {
                    let missed = self.times_fired_between(old_time, new_time);
                    self.times_triggered = self.times_triggered.saturating_add(missed);
                }
                self.next_fire_time = new_time;
            }
            MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                if let Schedule::Simple { repeat_count, .. } = &mut self.schedule {
                    if *repeat_count != 0 && *repeat_count != REPEAT_INDEFINITELY {
                        *repeat_count = (*repeat_count - self.times_triggered).max(0);
                        self.times_triggered = 0;
                    }
                }
                self.reschedule_now(now);
            }
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                let missed = self
                    .next_fire_time
                    .map(|old| self.times_fired_between(old, now))
                    .unwrap_or(0);
                let times_triggered = self.times_triggered;
                if let Schedule::Simple { repeat_count, .. } = &mut self.schedule {
                    if *repeat_count != 0 && *repeat_count != REPEAT_INDEFINITELY {
                        *repeat_count = (*repeat_count - (times_triggered + missed)).max(0);
                        self.times_triggered = 0;
                    }
                }
                self.reschedule_now(now);
            }
            _ => {
                self.next_fire_time = Some(now);
            }
        }
    }

    fn reschedule_now(&mut self, now: DateTime<Utc>) {
        match self.end_time {
            Some(end) if end < now => self.next_fire_time = None,
            _ => {
                self.start_time = now;
                self.next_fire_time = Some(now);
            }
        }
    }

    fn times_fired_between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> i32 {
        match self.schedule {
            Schedule::Simple {
                repeat_interval_ms, ..
            } if repeat_interval_ms > 0 => {
                let elapsed = (end - start).num_milliseconds().max(0);
                i32::try_from(elapsed / repeat_interval_ms).unwrap_or(i32::MAX)
            }
            _ => 0,
        }
    }

    /// 日历变更后重新计算下一次触发时间；已超过补火阈值的时间点直接跳过
    pub fn update_with_new_calendar(
        &mut self,
        calendar: Option<&Calendar>,
        misfire_threshold: Duration,
        now: DateTime<Utc>,
    ) {
        let after = self
            .previous_fire_time
            .unwrap_or(self.start_time - Duration::milliseconds(1));
        let mut next = compute_next_fire_time(self, calendar, after);
        if let (Some(candidate), Some(cutoff)) = (next, now.checked_sub_signed(misfire_threshold)) {
            if candidate <= cutoff {
                next = compute_next_fire_time(self, calendar, cutoff);
            }
        }
        self.next_fire_time = next;
    }

    /// 根据作业的执行结果决定完成指令
    pub fn execution_complete(
        &self,
        error: Option<&JobExecutionError>,
    ) -> CompletedExecutionInstruction {
        if let Some(error) = error {
            if error.refire_immediately {
                return CompletedExecutionInstruction::ReExecuteJob;
            }
            if error.unschedule_firing_trigger {
                return CompletedExecutionInstruction::SetTriggerComplete;
            }
            if error.unschedule_all_triggers {
                return CompletedExecutionInstruction::SetAllJobTriggersComplete;
            }
        }
        if !self.may_fire_again() {
            return CompletedExecutionInstruction::DeleteTrigger;
        }
        CompletedExecutionInstruction::Noop
    }
}

/// 严格晚于 `after`、且未被日历排除的下一次触发时间
///
/// 落在排除区间内时，直接跳到区间之后的第一个调度点；超过可调度年份时返回 None。
pub fn compute_next_fire_time(
    trigger: &Trigger,
    calendar: Option<&Calendar>,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let mut next = trigger.fire_time_after(after)?;
    let Some(calendar) = calendar else {
        return Some(next);
    };
    loop {
        let included = calendar.next_included_time(next)?;
        if included == next {
            return Some(next);
        }
        next = trigger.fire_time_after(included - Duration::milliseconds(1))?;
        if next.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::IntervalUnit;
    use chrono::{NaiveDate, TimeZone, Weekday};

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 12, 0, 0).unwrap()
    }

    fn simple_trigger(interval_ms: i64, repeat: i32) -> Trigger {
        Trigger::new(
            TriggerKey::with_default_group("t"),
            JobKey::with_default_group("j"),
            Schedule::simple(interval_ms, repeat),
        )
        .with_start_time(base_time())
    }

    #[test]
    fn test_first_fire_time_and_triggered() {
        let mut trigger = simple_trigger(20_000, REPEAT_INDEFINITELY);
        assert_eq!(trigger.compute_first_fire_time(None), Some(base_time()));
        trigger.triggered(None);
        assert_eq!(trigger.previous_fire_time, Some(base_time()));
        assert_eq!(
            trigger.next_fire_time,
            Some(base_time() + Duration::seconds(20))
        );
        assert_eq!(trigger.times_triggered, 1);
    }

    #[test]
    fn test_one_shot_trigger_completes() {
        let mut trigger = simple_trigger(0, 0);
        trigger.compute_first_fire_time(None);
        trigger.triggered(None);
        assert_eq!(trigger.next_fire_time, None);
        assert_eq!(
            trigger.execution_complete(None),
            CompletedExecutionInstruction::DeleteTrigger
        );
    }

    #[test]
    fn test_calendar_skips_excluded_days() {
        // 2024-01-13/14 为周末
        let cal = Calendar::weekly([Weekday::Sat, Weekday::Sun]);
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("daily"),
            JobKey::with_default_group("j"),
            Schedule::calendar_interval(1, IntervalUnit::Day),
        )
        .with_start_time(Utc.with_ymd_and_hms(2024, 1, 12, 9, 0, 0).unwrap());
        trigger.compute_first_fire_time(Some(&cal));
        trigger.triggered(Some(&cal));
        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_calendar_excluding_everything_gives_up() {
        let all_days = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        let cal = Calendar::weekly(all_days);
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("never"),
            JobKey::with_default_group("j"),
            Schedule::calendar_interval(1, IntervalUnit::Week),
        )
        .with_start_time(base_time());
        assert_eq!(trigger.compute_first_fire_time(Some(&cal)), None);
    }

    #[test]
    fn test_cron_misfire_fire_now_and_do_nothing() {
        let now = base_time() + Duration::minutes(10) + Duration::seconds(7);
        let mut fire_now = Trigger::new(
            TriggerKey::with_default_group("c1"),
            JobKey::with_default_group("j"),
            Schedule::cron("0 * * * * *").unwrap(),
        )
        .with_start_time(base_time());
        fire_now.compute_first_fire_time(None);
        fire_now.update_after_misfire(None, now);
        assert_eq!(fire_now.next_fire_time, Some(now));
        fire_now.triggered(None);
        // 立即触发后，回到调度规则上不早于本次触发时间的第一个点
        assert_eq!(
            fire_now.next_fire_time,
            Some(base_time() + Duration::minutes(11))
        );

        let mut skip = fire_now
            .clone()
            .with_misfire_instruction(MisfireInstruction::DoNothing);
        skip.next_fire_time = Some(base_time());
        skip.update_after_misfire(None, now);
        assert_eq!(skip.next_fire_time, Some(base_time() + Duration::minutes(11)));
    }

    #[test]
    fn test_simple_smart_misfire_policies() {
        let now = base_time() + Duration::seconds(95);

        // 无限重复：跳到下一个点，并计入错过的次数
        let mut forever = simple_trigger(20_000, REPEAT_INDEFINITELY);
        forever.compute_first_fire_time(None);
        forever.update_after_misfire(None, now);
        assert_eq!(
            forever.next_fire_time,
            Some(base_time() + Duration::seconds(100))
        );
        assert_eq!(forever.times_triggered, 5);

        // 有限重复：从现在开始，保留剩余的重复次数
        let mut finite = simple_trigger(20_000, 3);
        finite.compute_first_fire_time(None);
        finite.triggered(None);
        finite.update_after_misfire(None, now);
        assert_eq!(finite.next_fire_time, Some(now));
        assert_eq!(finite.start_time, now);
        assert_eq!(finite.times_triggered, 0);
        assert_eq!(finite.schedule, Schedule::simple(20_000, 2));

        // 单次：立即触发
        let mut once = simple_trigger(0, 0);
        once.compute_first_fire_time(None);
        once.update_after_misfire(None, now);
        assert_eq!(once.next_fire_time, Some(now));
    }

    #[test]
    fn test_ignore_misfire_policy_keeps_time() {
        let mut trigger = simple_trigger(1_000, REPEAT_INDEFINITELY)
            .with_misfire_instruction(MisfireInstruction::IgnoreMisfirePolicy);
        trigger.compute_first_fire_time(None);
        trigger.update_after_misfire(None, base_time() + Duration::hours(1));
        assert_eq!(trigger.next_fire_time, Some(base_time()));
    }

    #[test]
    fn test_execution_complete_instructions() {
        let mut trigger = simple_trigger(1_000, REPEAT_INDEFINITELY);
        trigger.compute_first_fire_time(None);
        assert_eq!(
            trigger.execution_complete(Some(&JobExecutionError::refire("again"))),
            CompletedExecutionInstruction::ReExecuteJob
        );
        assert_eq!(
            trigger.execution_complete(Some(&JobExecutionError::unschedule_firing_trigger("x"))),
            CompletedExecutionInstruction::SetTriggerComplete
        );
        assert_eq!(
            trigger.execution_complete(Some(&JobExecutionError::unschedule_all_triggers("x"))),
            CompletedExecutionInstruction::SetAllJobTriggersComplete
        );
        assert_eq!(
            trigger.execution_complete(Some(&JobExecutionError::new("plain"))),
            CompletedExecutionInstruction::Noop
        );
    }

    #[test]
    fn test_update_with_new_calendar_skips_excluded_dates() {
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("daily"),
            JobKey::with_default_group("j"),
            Schedule::calendar_interval(1, IntervalUnit::Day),
        )
        .with_start_time(Utc.with_ymd_and_hms(2030, 1, 1, 9, 0, 0).unwrap());
        trigger.compute_first_fire_time(None);
        let holiday = Calendar::holiday([NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()]);
        trigger.update_with_new_calendar(Some(&holiday), Duration::seconds(60), base_time());
        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2030, 1, 2, 9, 0, 0).unwrap())
        );
    }

    fn holiday_week_2030() -> Calendar {
        Calendar::holiday((1..=7).map(|d| NaiveDate::from_ymd_opt(2030, 1, d).unwrap()))
    }

    #[test]
    fn test_long_exclusion_jumps_past_holiday_week() {
        // 一周的排除区间内有 60 万个以上的 1 秒调度点
        let cal = holiday_week_2030();
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("per-second"),
            JobKey::with_default_group("j"),
            Schedule::simple(1_000, REPEAT_INDEFINITELY),
        )
        .with_start_time(Utc.with_ymd_and_hms(2029, 12, 31, 23, 59, 59).unwrap());
        assert_eq!(
            trigger.compute_first_fire_time(Some(&cal)),
            Some(Utc.with_ymd_and_hms(2029, 12, 31, 23, 59, 59).unwrap())
        );
        trigger.triggered(Some(&cal));
        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_long_exclusion_lands_on_schedule_point() {
        // 7 秒间隔与午夜不对齐，应落在排除区间之后的第一个调度点
        let cal = holiday_week_2030();
        let start = Utc.with_ymd_and_hms(2029, 12, 31, 23, 59, 55).unwrap();
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("seven-seconds"),
            JobKey::with_default_group("j"),
            Schedule::simple(7_000, REPEAT_INDEFINITELY),
        )
        .with_start_time(start);
        trigger.compute_first_fire_time(Some(&cal));
        trigger.triggered(Some(&cal));
        let next = trigger.next_fire_time.unwrap();
        assert!(next >= Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 0).unwrap());
        assert!(next < Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 7).unwrap());
        assert_eq!((next - start).num_milliseconds() % 7_000, 0);
    }

    #[test]
    fn test_update_with_new_calendar_long_exclusion() {
        let mut trigger = Trigger::new(
            TriggerKey::with_default_group("per-second"),
            JobKey::with_default_group("j"),
            Schedule::simple(1_000, REPEAT_INDEFINITELY),
        )
        .with_start_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        trigger.compute_first_fire_time(None);
        trigger.update_with_new_calendar(
            Some(&holiday_week_2030()),
            Duration::seconds(60),
            base_time(),
        );
        assert_eq!(
            trigger.next_fire_time,
            Some(Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_update_with_new_calendar_skips_misfired_points() {
        let mut trigger = simple_trigger(60_000, REPEAT_INDEFINITELY);
        trigger.compute_first_fire_time(None);
        // 起始时间已过去 10 分钟，超过 60 秒阈值的时间点不再补火
        let now = base_time() + Duration::minutes(10);
        trigger.update_with_new_calendar(None, Duration::seconds(60), now);
        assert_eq!(
            trigger.next_fire_time,
            Some(base_time() + Duration::minutes(10))
        );
    }

    #[test]
    fn test_validate_rejects_wrong_misfire_instruction() {
        let trigger = simple_trigger(1_000, 5)
            .with_misfire_instruction(MisfireInstruction::DoNothing);
        assert!(trigger.validate().is_err());
        let trigger = simple_trigger(1_000, 5).with_end_time(base_time() - Duration::seconds(1));
        assert!(trigger.validate().is_err());
        assert!(simple_trigger(1_000, 5).validate().is_ok());
    }
}
