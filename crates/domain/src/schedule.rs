use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Timelike, Utc};
use cron::TimeUnitSpec;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use scheduler_errors::{SchedulerError, SchedulerResult};

/// 不再计算晚于该年份的触发时间
pub const YEAR_TO_GIVE_UP_SCHEDULING_AT: i32 = 2299;

/// 重复次数为 -1 时表示无限重复
pub const REPEAT_INDEFINITELY: i32 = -1;

/// 已解析的CRON表达式（UTC，秒级精度）
///
/// 支持 6/7 段的秒级表达式；5 段的标准表达式会自动补齐秒字段 `0`。
#[derive(Clone)]
pub struct CronExpression {
    source: String,
    schedule: cron::Schedule,
}

impl CronExpression {
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let trimmed = expr.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };
        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
                expr: expr.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            source: trimmed.to_string(),
            schedule,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// 严格晚于 `after` 的第一个匹配时间
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }

    /// 给定时间（秒级）是否满足表达式
    pub fn is_satisfied_by(&self, time: DateTime<Utc>) -> bool {
        self.schedule.includes(time)
    }

    /// 不早于 `time` 的第一个不满足表达式的时间点
    ///
    /// 在最细的非 `*` 字段粒度上前进，每步都落在该粒度的起点。
    pub fn next_unsatisfied_from(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.is_satisfied_by(time) {
            return Some(time);
        }
        let s = &self.schedule;
        let step: fn(DateTime<Utc>) -> Option<DateTime<Utc>> = if !s.seconds().is_all() {
            |t| Some(t.with_nanosecond(0)? + Duration::seconds(1))
        } else if !s.minutes().is_all() {
            |t| Some(t.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1))
        } else if !s.hours().is_all() {
            |t| Some(t.with_minute(0)?.with_second(0)?.with_nanosecond(0)? + Duration::hours(1))
        } else if !s.days_of_month().is_all() || !s.days_of_week().is_all() {
            |t| Some(t.date_naive().succ_opt()?.and_time(NaiveTime::MIN).and_utc())
        } else if !s.months().is_all() {
            |t| {
                let first = t.date_naive().with_day(1)?;
                Some(first.checked_add_months(Months::new(1))?.and_time(NaiveTime::MIN).and_utc())
            }
        } else if !s.years().is_all() {
            |t| Some(NaiveDate::from_ymd_opt(t.year() + 1, 1, 1)?.and_time(NaiveTime::MIN).and_utc())
        } else {
            // 每个字段都是 `*`：没有不满足的时间点
            return None;
        };
        let mut candidate = time;
        loop {
            candidate = step(candidate)?;
            if candidate.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            if !self.is_satisfied_by(candidate) {
                return Some(candidate);
            }
        }
    }
}

impl fmt::Debug for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronExpression").field(&self.source).finish()
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl PartialEq for CronExpression {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for CronExpression {}

impl FromStr for CronExpression {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for CronExpression {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for CronExpression {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// 日历间隔的时间单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntervalUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl IntervalUnit {
    fn fixed_millis(self) -> Option<i64> {
        match self {
            IntervalUnit::Second => Some(1_000),
            IntervalUnit::Minute => Some(60_000),
            IntervalUnit::Hour => Some(3_600_000),
            IntervalUnit::Day => Some(86_400_000),
            IntervalUnit::Week => Some(7 * 86_400_000),
            IntervalUnit::Month | IntervalUnit::Year => None,
        }
    }
}

/// 触发器的调度规则
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// 固定间隔重复，`repeat_count` 为首次之外的重复次数，-1 表示无限
    Simple {
        repeat_interval_ms: i64,
        repeat_count: i32,
    },
    Cron {
        expression: CronExpression,
    },
    /// 按日历单位递增（月、年按日历运算）
    CalendarInterval { interval: u32, unit: IntervalUnit },
}

/// 调度规则的种类，用于校验与解析智能补火策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleKind {
    Simple,
    Cron,
    CalendarInterval,
}

impl fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScheduleKind::Simple => "SIMPLE",
            ScheduleKind::Cron => "CRON",
            ScheduleKind::CalendarInterval => "CAL_INT",
        };
        f.write_str(s)
    }
}

impl Schedule {
    pub fn simple(repeat_interval_ms: i64, repeat_count: i32) -> Self {
        Schedule::Simple {
            repeat_interval_ms,
            repeat_count,
        }
    }

    pub fn once() -> Self {
        Self::simple(0, 0)
    }

    pub fn cron(expr: &str) -> SchedulerResult<Self> {
        Ok(Schedule::Cron {
            expression: CronExpression::parse(expr)?,
        })
    }

    pub fn calendar_interval(interval: u32, unit: IntervalUnit) -> Self {
        Schedule::CalendarInterval { interval, unit }
    }

    pub fn kind(&self) -> ScheduleKind {
        match self {
            Schedule::Simple { .. } => ScheduleKind::Simple,
            Schedule::Cron { .. } => ScheduleKind::Cron,
            Schedule::CalendarInterval { .. } => ScheduleKind::CalendarInterval,
        }
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        match self {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
            } => {
                if *repeat_count < REPEAT_INDEFINITELY {
                    return Err(SchedulerError::invalid_schedule(format!(
                        "重复次数无效: {repeat_count}"
                    )));
                }
                if *repeat_interval_ms < 0 {
                    return Err(SchedulerError::invalid_schedule("重复间隔不能为负数"));
                }
                if *repeat_count != 0 && *repeat_interval_ms < 1 {
                    return Err(SchedulerError::invalid_schedule(
                        "重复触发器的间隔必须至少为1毫秒",
                    ));
                }
                Ok(())
            }
            Schedule::Cron { .. } => Ok(()),
            Schedule::CalendarInterval { interval, .. } => {
                if *interval < 1 {
                    return Err(SchedulerError::invalid_schedule("日历间隔必须至少为1"));
                }
                Ok(())
            }
        }
    }

    /// 不考虑日历，计算严格晚于 `after` 的下一次触发时间
    ///
    /// 纯函数：相同的输入总是得到相同的结果。
    pub fn fire_time_after(
        &self,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
        times_triggered: i32,
        after: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if let Some(end) = end_time {
            if end <= after {
                return None;
            }
        }
        let next = match self {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
            } => simple_fire_time_after(
                start_time,
                *repeat_interval_ms,
                *repeat_count,
                times_triggered,
                after,
            ),
            Schedule::Cron { expression } => {
                let from = after.max(start_time - Duration::milliseconds(1));
                expression.next_after(from)
            }
            Schedule::CalendarInterval { interval, unit } => {
                calendar_interval_fire_time_after(start_time, *interval, *unit, after)
            }
        }?;
        if let Some(end) = end_time {
            if next > end {
                return None;
            }
        }
        if next.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
            return None;
        }
        Some(next)
    }

    /// 不考虑日历的最后一次触发时间，无限重复时为 None
    pub fn final_fire_time(
        &self,
        start_time: DateTime<Utc>,
        end_time: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Simple {
                repeat_interval_ms,
                repeat_count,
            } => {
                if *repeat_count == 0 {
                    return Some(start_time);
                }
                if *repeat_count == REPEAT_INDEFINITELY {
                    let end = end_time?;
                    return self.fire_time_before(start_time, end);
                }
                let last = repeat_interval_ms
                    .checked_mul(i64::from(*repeat_count))
                    .and_then(Duration::try_milliseconds)
                    .and_then(|span| start_time.checked_add_signed(span));
                match (last, end_time) {
                    (Some(last), Some(end)) if last > end => self.fire_time_before(start_time, end),
                    (Some(last), _) => Some(last),
                    (None, Some(end)) => self.fire_time_before(start_time, end),
                    (None, None) => None,
                }
            }
            _ => None,
        }
    }

    /// 不晚于 `end` 的最后一个调度点
    fn fire_time_before(
        &self,
        start_time: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let Schedule::Simple {
            repeat_interval_ms, ..
        } = self
        else {
            return None;
        };
        if end < start_time || *repeat_interval_ms < 1 {
            return None;
        }
        let elapsed = (end - start_time).num_milliseconds();
        let steps = elapsed / repeat_interval_ms;
        start_time.checked_add_signed(Duration::try_milliseconds(steps * repeat_interval_ms)?)
    }
}

fn simple_fire_time_after(
    start_time: DateTime<Utc>,
    repeat_interval_ms: i64,
    repeat_count: i32,
    times_triggered: i32,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if repeat_count != REPEAT_INDEFINITELY && times_triggered > repeat_count {
        return None;
    }
    if repeat_count == 0 && after >= start_time {
        return None;
    }
    if after < start_time {
        return Some(start_time);
    }
    if repeat_interval_ms < 1 {
        return None;
    }
    let executed = (after - start_time).num_milliseconds() / repeat_interval_ms + 1;
    if repeat_count != REPEAT_INDEFINITELY && executed > i64::from(repeat_count) {
        return None;
    }
    start_time.checked_add_signed(Duration::milliseconds(
        executed.checked_mul(repeat_interval_ms)?,
    ))
}

fn calendar_interval_fire_time_after(
    start_time: DateTime<Utc>,
    interval: u32,
    unit: IntervalUnit,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if after < start_time {
        return Some(start_time);
    }
    if interval == 0 {
        return None;
    }
    if let Some(unit_ms) = unit.fixed_millis() {
        let step = unit_ms * i64::from(interval);
        let jumps = (after - start_time).num_milliseconds() / step + 1;
        return start_time.checked_add_signed(Duration::milliseconds(jumps.checked_mul(step)?));
    }

    let months_per_step = match unit {
        IntervalUnit::Year => interval.checked_mul(12)?,
        _ => interval,
    };
    let elapsed_months = (after.year() - start_time.year()) * 12
        + (after.month() as i32 - start_time.month() as i32);
    // 先按月份差估算，再逐步修正（月末日期会被截断）
    let mut jumps = (elapsed_months.max(0) as u32 / months_per_step).saturating_sub(1);
    loop {
        let candidate =
            start_time.checked_add_months(Months::new(jumps.checked_mul(months_per_step)?))?;
        if candidate > after {
            return Some(candidate);
        }
        if candidate.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
            return None;
        }
        jumps = jumps.checked_add(1)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 10, h, m, s).unwrap()
    }

    #[test]
    fn test_simple_schedule_steps() {
        let schedule = Schedule::simple(20_000, REPEAT_INDEFINITELY);
        let start = at(12, 0, 0);
        assert_eq!(
            schedule.fire_time_after(start, None, 0, start - Duration::seconds(5)),
            Some(start)
        );
        assert_eq!(
            schedule.fire_time_after(start, None, 1, start),
            Some(at(12, 0, 20))
        );
        assert_eq!(
            schedule.fire_time_after(start, None, 3, at(12, 0, 45)),
            Some(at(12, 1, 0))
        );
    }

    #[test]
    fn test_simple_schedule_respects_repeat_count_and_end() {
        let schedule = Schedule::simple(1_000, 2);
        let start = at(12, 0, 0);
        assert_eq!(
            schedule.fire_time_after(start, None, 2, at(12, 0, 1)),
            Some(at(12, 0, 2))
        );
        assert_eq!(schedule.fire_time_after(start, None, 3, at(12, 0, 2)), None);

        let forever = Schedule::simple(1_000, REPEAT_INDEFINITELY);
        // 结束时间本身仍可触发
        assert_eq!(
            forever.fire_time_after(start, Some(at(12, 0, 3)), 3, at(12, 0, 2)),
            Some(at(12, 0, 3))
        );
        assert_eq!(
            forever.fire_time_after(start, Some(at(12, 0, 3)), 4, at(12, 0, 3)),
            None
        );
        assert_eq!(
            Schedule::once().fire_time_after(start, None, 1, start),
            None
        );
    }

    #[test]
    fn test_final_fire_time_with_end_and_large_counts() {
        let start = at(12, 0, 0);
        let forever = Schedule::simple(1_000, REPEAT_INDEFINITELY);
        assert_eq!(forever.final_fire_time(start, None), None);
        assert_eq!(
            forever.final_fire_time(start, Some(at(12, 0, 3))),
            Some(at(12, 0, 3))
        );
        assert_eq!(
            forever.final_fire_time(start, Some(at(12, 0, 3) + Duration::milliseconds(500))),
            Some(at(12, 0, 3))
        );

        let bounded = Schedule::simple(1_000, 3);
        assert_eq!(
            bounded.final_fire_time(start, Some(at(12, 0, 3))),
            Some(at(12, 0, 3))
        );
        assert_eq!(
            bounded.final_fire_time(start, Some(at(12, 0, 2))),
            Some(at(12, 0, 2))
        );

        // 间隔乘以次数溢出时不 panic
        let huge = Schedule::Simple {
            repeat_interval_ms: i64::MAX / 2,
            repeat_count: i32::MAX,
        };
        assert_eq!(huge.final_fire_time(start, None), None);
        assert_eq!(
            huge.final_fire_time(start, Some(at(13, 0, 0))),
            Some(start)
        );
    }

    #[test]
    fn test_cron_schedule_uses_start_time() {
        let schedule = Schedule::cron("0 */5 * * * *").unwrap();
        let start = at(12, 3, 0);
        assert_eq!(
            schedule.fire_time_after(start, None, 0, at(11, 0, 0)),
            Some(at(12, 5, 0))
        );
        assert_eq!(
            schedule.fire_time_after(start, None, 1, at(12, 5, 0)),
            Some(at(12, 10, 0))
        );
    }

    #[test]
    fn test_cron_expression_accepts_five_fields() {
        let expr = CronExpression::parse("*/15 * * * *").unwrap();
        assert_eq!(expr.next_after(at(12, 0, 0)), Some(at(12, 15, 0)));
        assert!(CronExpression::parse("not a cron").is_err());
    }

    #[test]
    fn test_calendar_interval_months_clamp_from_start() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 8, 0, 0).unwrap();
        let schedule = Schedule::calendar_interval(1, IntervalUnit::Month);
        let first = schedule.fire_time_after(start, None, 1, start).unwrap();
        assert_eq!(first, Utc.with_ymd_and_hms(2024, 2, 29, 8, 0, 0).unwrap());
        let second = schedule.fire_time_after(start, None, 2, first).unwrap();
        assert_eq!(second, Utc.with_ymd_and_hms(2024, 3, 31, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_calendar_interval_fixed_units() {
        let start = at(0, 0, 0);
        let schedule = Schedule::calendar_interval(2, IntervalUnit::Hour);
        assert_eq!(
            schedule.fire_time_after(start, None, 0, at(3, 0, 0)),
            Some(at(4, 0, 0))
        );
    }

    #[test]
    fn test_next_fire_time_monotonic() {
        let schedules = vec![
            Schedule::simple(7_000, REPEAT_INDEFINITELY),
            Schedule::cron("*/13 * * * * *").unwrap(),
            Schedule::calendar_interval(3, IntervalUnit::Minute),
        ];
        let start = at(12, 0, 0);
        for schedule in schedules {
            let mut previous = None;
            for offset in 0..200 {
                let after = start + Duration::seconds(offset * 3);
                let next = schedule.fire_time_after(start, None, 1, after);
                assert!(next.is_some());
                assert!(next > Some(after));
                if let Some(prev) = previous {
                    assert!(next >= Some(prev));
                }
                previous = next;
            }
        }
    }

    #[test]
    fn test_schedule_validation() {
        assert!(Schedule::simple(0, 3).validate().is_err());
        assert!(Schedule::simple(10, -2).validate().is_err());
        assert!(Schedule::once().validate().is_ok());
        assert!(Schedule::calendar_interval(0, IntervalUnit::Day)
            .validate()
            .is_err());
    }

    #[test]
    fn test_schedule_serde_round_trip() {
        let schedule = Schedule::cron("0 0 12 * * *").unwrap();
        let json = serde_json::to_string(&schedule).unwrap();
        assert!(json.contains("\"kind\":\"cron\""));
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schedule);
    }
}
