use std::collections::BTreeSet;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::schedule::{CronExpression, YEAR_TO_GIVE_UP_SCHEDULING_AT};
use crate::value_objects::truncate_to_millis;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 命名的排除规则（停机日、周末等），触发器按名称引用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Calendar {
    #[serde(default)]
    pub description: Option<String>,
    /// 基础日历：只有基础日历包含的时间才会继续判断
    #[serde(default)]
    pub base: Option<Box<Calendar>>,
    pub rule: CalendarRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CalendarRule {
    /// 排除整天
    Holiday { excluded_dates: BTreeSet<NaiveDate> },
    /// 排除一周中的某几天
    Weekly { excluded_days: Vec<Weekday> },
    /// 排除每天的某个时间段（闭区间），`invert` 为 true 时只包含该时间段
    Daily {
        range_start: NaiveTime,
        range_end: NaiveTime,
        #[serde(default)]
        invert: bool,
    },
    /// 排除满足表达式的时间点
    Cron { expression: CronExpression },
}

impl Calendar {
    pub fn new(rule: CalendarRule) -> Self {
        Self {
            description: None,
            base: None,
            rule,
        }
    }

    pub fn holiday(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self::new(CalendarRule::Holiday {
            excluded_dates: dates.into_iter().collect(),
        })
    }

    pub fn weekly(days: impl IntoIterator<Item = Weekday>) -> Self {
        Self::new(CalendarRule::Weekly {
            excluded_days: days.into_iter().collect(),
        })
    }

    pub fn daily(range_start: NaiveTime, range_end: NaiveTime) -> SchedulerResult<Self> {
        if range_end < range_start {
            return Err(SchedulerError::validation_error(
                "每日排除区间的结束时间不能早于开始时间",
            ));
        }
        Ok(Self::new(CalendarRule::Daily {
            range_start,
            range_end,
            invert: false,
        }))
    }

    pub fn cron(expr: &str) -> SchedulerResult<Self> {
        Ok(Self::new(CalendarRule::Cron {
            expression: CronExpression::parse(expr)?,
        }))
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_base(mut self, base: Calendar) -> Self {
        self.base = Some(Box::new(base));
        self
    }

    pub fn inverted(mut self) -> Self {
        if let CalendarRule::Daily { invert, .. } = &mut self.rule {
            *invert = !*invert;
        }
        self
    }

    pub fn is_time_included(&self, time: DateTime<Utc>) -> bool {
        if let Some(base) = &self.base {
            if !base.is_time_included(time) {
                return false;
            }
        }
        !self.rule.excludes(time)
    }

    pub fn excludes(&self, time: DateTime<Utc>) -> bool {
        !self.is_time_included(time)
    }

    /// 不早于 `time` 的第一个被包含的时间点（毫秒精度）
    ///
    /// 按排除区间整段跳过；超过可调度年份仍找不到时返回 None。
    pub fn next_included_time(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut candidate = time;
        loop {
            if candidate.year() > YEAR_TO_GIVE_UP_SCHEDULING_AT {
                return None;
            }
            let allowed = self.rule.next_allowed(candidate)?;
            let allowed = match &self.base {
                Some(base) => base.next_included_time(allowed)?,
                None => allowed,
            };
            if allowed == candidate {
                return Some(candidate);
            }
            candidate = allowed;
        }
    }
}

fn start_of_next_day(time: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let next = time.date_naive().succ_opt()?;
    Some(next.and_time(NaiveTime::MIN).and_utc())
}

impl CalendarRule {
    fn excludes(&self, time: DateTime<Utc>) -> bool {
        match self {
            CalendarRule::Holiday { excluded_dates } => excluded_dates.contains(&time.date_naive()),
            CalendarRule::Weekly { excluded_days } => excluded_days.contains(&time.weekday()),
            CalendarRule::Daily {
                range_start,
                range_end,
                invert,
            } => {
                let tod = time.time();
                let inside = tod >= *range_start && tod <= *range_end;
                inside != *invert
            }
            CalendarRule::Cron { expression } => expression.is_satisfied_by(time),
        }
    }

    /// 不早于 `time` 且不被本规则排除的第一个时间点（不看基础日历）
    fn next_allowed(&self, time: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.excludes(time) {
            return Some(time);
        }
        match self {
            CalendarRule::Holiday { excluded_dates } => {
                let mut day = time.date_naive().succ_opt()?;
                while excluded_dates.contains(&day) {
                    day = day.succ_opt()?;
                }
                Some(day.and_time(NaiveTime::MIN).and_utc())
            }
            CalendarRule::Weekly { .. } => {
                let mut candidate = start_of_next_day(time)?;
                for _ in 0..7 {
                    if !self.excludes(candidate) {
                        return Some(candidate);
                    }
                    candidate = start_of_next_day(candidate)?;
                }
                None
            }
            CalendarRule::Daily {
                range_start,
                range_end,
                invert,
            } => {
                if *invert {
                    // 只包含区间内：区间之前跳到当天起点，之后跳到次日起点
                    if time.time() < *range_start {
                        Some(time.date_naive().and_time(*range_start).and_utc())
                    } else {
                        let day = time.date_naive().succ_opt()?;
                        Some(day.and_time(*range_start).and_utc())
                    }
                } else {
                    let end = time.date_naive().and_time(*range_end).and_utc();
                    let after = truncate_to_millis(end) + Duration::milliseconds(1);
                    if self.excludes(after) {
                        return None;
                    }
                    Some(after)
                }
            }
            CalendarRule::Cron { expression } => expression.next_unsatisfied_from(time),
        }
    }
}
