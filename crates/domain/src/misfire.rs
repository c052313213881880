use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::schedule::ScheduleKind;
use scheduler_errors::SchedulerError;

/// 触发器错过触发时间后的补救策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MisfireInstruction {
    /// 按调度规则的种类选择合适的策略
    #[default]
    Smart,
    /// 不做补救处理，按原计划时间尽快触发所有错过的触发
    IgnoreMisfirePolicy,
    /// 立即触发一次
    FireNow,
    /// 跳过错过的触发，等待下一个调度时间点
    DoNothing,
    RescheduleNowWithExistingRepeatCount,
    RescheduleNowWithRemainingRepeatCount,
    RescheduleNextWithRemainingCount,
    RescheduleNextWithExistingCount,
}

impl MisfireInstruction {
    pub fn as_str(&self) -> &'static str {
        match self {
            MisfireInstruction::Smart => "SMART",
            MisfireInstruction::IgnoreMisfirePolicy => "IGNORE_MISFIRE_POLICY",
            MisfireInstruction::FireNow => "FIRE_NOW",
            MisfireInstruction::DoNothing => "DO_NOTHING",
            MisfireInstruction::RescheduleNowWithExistingRepeatCount => {
                "RESCHEDULE_NOW_WITH_EXISTING_REPEAT_COUNT"
            }
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount => {
                "RESCHEDULE_NOW_WITH_REMAINING_REPEAT_COUNT"
            }
            MisfireInstruction::RescheduleNextWithRemainingCount => {
                "RESCHEDULE_NEXT_WITH_REMAINING_COUNT"
            }
            MisfireInstruction::RescheduleNextWithExistingCount => {
                "RESCHEDULE_NEXT_WITH_EXISTING_COUNT"
            }
        }
    }

    /// 该策略是否适用于给定种类的调度规则
    pub fn is_valid_for(&self, kind: ScheduleKind) -> bool {
        match self {
            MisfireInstruction::Smart
            | MisfireInstruction::IgnoreMisfirePolicy
            | MisfireInstruction::FireNow => true,
            MisfireInstruction::DoNothing => {
                matches!(kind, ScheduleKind::Cron | ScheduleKind::CalendarInterval)
            }
            MisfireInstruction::RescheduleNowWithExistingRepeatCount
            | MisfireInstruction::RescheduleNowWithRemainingRepeatCount
            | MisfireInstruction::RescheduleNextWithRemainingCount
            | MisfireInstruction::RescheduleNextWithExistingCount => kind == ScheduleKind::Simple,
        }
    }
}

impl fmt::Display for MisfireInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MisfireInstruction {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let instruction = match s {
            "SMART" => MisfireInstruction::Smart,
            "IGNORE_MISFIRE_POLICY" => MisfireInstruction::IgnoreMisfirePolicy,
            "FIRE_NOW" => MisfireInstruction::FireNow,
            "DO_NOTHING" => MisfireInstruction::DoNothing,
            "RESCHEDULE_NOW_WITH_EXISTING_REPEAT_COUNT" => {
                MisfireInstruction::RescheduleNowWithExistingRepeatCount
            }
            "RESCHEDULE_NOW_WITH_REMAINING_REPEAT_COUNT" => {
                MisfireInstruction::RescheduleNowWithRemainingRepeatCount
            }
            "RESCHEDULE_NEXT_WITH_REMAINING_COUNT" => {
                MisfireInstruction::RescheduleNextWithRemainingCount
            }
            "RESCHEDULE_NEXT_WITH_EXISTING_COUNT" => {
                MisfireInstruction::RescheduleNextWithExistingCount
            }
            other => {
                return Err(SchedulerError::Serialization(format!(
                    "未知的补火策略: {other}"
                )))
            }
        };
        Ok(instruction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validity_per_schedule_kind() {
        assert!(MisfireInstruction::DoNothing.is_valid_for(ScheduleKind::Cron));
        assert!(!MisfireInstruction::DoNothing.is_valid_for(ScheduleKind::Simple));
        assert!(MisfireInstruction::RescheduleNextWithRemainingCount
            .is_valid_for(ScheduleKind::Simple));
        assert!(!MisfireInstruction::RescheduleNextWithRemainingCount
            .is_valid_for(ScheduleKind::CalendarInterval));
        assert!(MisfireInstruction::FireNow.is_valid_for(ScheduleKind::CalendarInterval));
    }

    #[test]
    fn test_string_mapping() {
        for instruction in [
            MisfireInstruction::Smart,
            MisfireInstruction::IgnoreMisfirePolicy,
            MisfireInstruction::RescheduleNowWithRemainingRepeatCount,
        ] {
            assert_eq!(
                instruction.as_str().parse::<MisfireInstruction>().unwrap(),
                instruction
            );
        }
        assert!("BOGUS".parse::<MisfireInstruction>().is_err());
    }
}
