//! 行与领域对象之间的转换

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use scheduler_domain::{
    Calendar, FiredTriggerRecord, FiredTriggerState, JobDataMap, JobDetail, JobKey,
    MisfireInstruction, Schedule, SchedulerStateRecord, Trigger, TriggerKey, TriggerState,
};
use scheduler_errors::{SchedulerError, SchedulerResult};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn opt_to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(Self::to_millis)
    }

    pub fn from_millis(ms: i64) -> SchedulerResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的时间戳: {ms}")))
    }

    pub fn opt_from_millis(ms: Option<i64>) -> SchedulerResult<Option<DateTime<Utc>>> {
        ms.map(Self::from_millis).transpose()
    }

    pub fn data_to_json(data: &JobDataMap) -> SchedulerResult<String> {
        Ok(serde_json::to_string(data)?)
    }

    pub fn parse_data(row: &SqliteRow, field_name: &str) -> SchedulerResult<JobDataMap> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析数据映射失败: {e}")))
    }

    pub fn schedule_to_json(schedule: &Schedule) -> SchedulerResult<String> {
        Ok(serde_json::to_string(schedule)?)
    }

    pub fn calendar_to_json(calendar: &Calendar) -> SchedulerResult<String> {
        Ok(serde_json::to_string(calendar)?)
    }

    pub fn row_to_job(row: &SqliteRow) -> SchedulerResult<JobDetail> {
        Ok(JobDetail {
            key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            job_type: row.try_get("job_type")?,
            description: row.try_get("description")?,
            job_data: Self::parse_data(row, "job_data")?,
            durable: row.try_get("is_durable")?,
            concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
            persist_job_data_after_execution: row.try_get("is_update_data")?,
            requests_recovery: row.try_get("requests_recovery")?,
        })
    }

    pub fn row_to_trigger(row: &SqliteRow) -> SchedulerResult<Trigger> {
        let schedule_json: String = row.try_get("schedule")?;
        let schedule: Schedule = serde_json::from_str(&schedule_json)
            .map_err(|e| SchedulerError::Serialization(format!("解析调度规则失败: {e}")))?;
        let misfire: String = row.try_get("misfire_instruction")?;
        let state: String = row.try_get("trigger_state")?;

        Ok(Trigger {
            key: TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            ),
            job_key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            description: row.try_get("description")?,
            calendar_name: row.try_get("calendar_name")?,
            job_data: Self::parse_data(row, "job_data")?,
            priority: row.try_get("priority")?,
            misfire_instruction: misfire.parse::<MisfireInstruction>()?,
            start_time: Self::from_millis(row.try_get("start_time")?)?,
            end_time: Self::opt_from_millis(row.try_get("end_time")?)?,
            schedule,
            next_fire_time: Self::opt_from_millis(row.try_get("next_fire_time")?)?,
            previous_fire_time: Self::opt_from_millis(row.try_get("prev_fire_time")?)?,
            times_triggered: row.try_get("times_triggered")?,
            state: state.parse::<TriggerState>()?,
            fire_instance_id: None,
        })
    }

    pub fn row_to_fired_record(row: &SqliteRow) -> SchedulerResult<FiredTriggerRecord> {
        let state: String = row.try_get("state")?;
        Ok(FiredTriggerRecord {
            fire_instance_id: row.try_get("entry_id")?,
            trigger_key: TriggerKey::new(
                row.try_get::<String, _>("trigger_name")?,
                row.try_get::<String, _>("trigger_group")?,
            ),
            job_key: JobKey::new(
                row.try_get::<String, _>("job_name")?,
                row.try_get::<String, _>("job_group")?,
            ),
            instance_id: row.try_get("instance_id")?,
            fired_at: Self::from_millis(row.try_get("fired_time")?)?,
            scheduled_at: Self::from_millis(row.try_get("sched_time")?)?,
            priority: row.try_get("priority")?,
            state: state.parse::<FiredTriggerState>()?,
            concurrent_execution_disallowed: row.try_get("is_nonconcurrent")?,
            requests_recovery: row.try_get("requests_recovery")?,
        })
    }

    pub fn row_to_state_record(row: &SqliteRow) -> SchedulerResult<SchedulerStateRecord> {
        Ok(SchedulerStateRecord {
            instance_id: row.try_get("instance_id")?,
            last_checkin_time: Self::from_millis(row.try_get("last_checkin_time")?)?,
            checkin_interval_ms: row.try_get("checkin_interval")?,
        })
    }

    pub fn row_to_calendar(row: &SqliteRow) -> SchedulerResult<Calendar> {
        let json_str: String = row.try_get("calendar")?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析日历失败: {e}")))
    }
}
