//! 作业存储的 SQL 语句
//!
//! 所有方法都在调用方给出的连接上执行，事务与锁由调用方负责；每条语句都按 `sched_name` 过滤。

use chrono::{DateTime, Utc};
use sqlx::{Row, SqliteConnection};

use scheduler_domain::{
    Calendar, FiredTriggerRecord, FiredTriggerState, JobDataMap, JobDetail, JobKey,
    MisfireInstruction, SchedulerStateRecord, Trigger, TriggerKey, TriggerState,
};
use scheduler_errors::SchedulerResult;

use crate::database::MappingHelpers;

/// 特殊分组名：表示"全部暂停"
pub const ALL_GROUPS_PAUSED: &str = "_$_ALL_GROUPS_PAUSED_$_";

#[derive(Debug, Clone)]
pub struct StoreDelegate {
    sched_name: String,
}

impl StoreDelegate {
    pub fn new(sched_name: impl Into<String>) -> Self {
        Self {
            sched_name: sched_name.into(),
        }
    }

    pub fn sched_name(&self) -> &str {
        &self.sched_name
    }

    // ---- 作业 ----

    pub async fn insert_job(&self, conn: &mut SqliteConnection, job: &JobDetail) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_jobs (
                sched_name, job_name, job_group, job_type, description, job_data,
                is_durable, is_nonconcurrent, is_update_data, requests_recovery
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(MappingHelpers::data_to_json(&job.job_data)?)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_job_data_after_execution)
        .bind(job.requests_recovery)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_job(&self, conn: &mut SqliteConnection, job: &JobDetail) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_jobs SET
                job_type = ?, description = ?, job_data = ?, is_durable = ?,
                is_nonconcurrent = ?, is_update_data = ?, requests_recovery = ?
            WHERE sched_name = ? AND job_name = ? AND job_group = ?
            "#,
        )
        .bind(&job.job_type)
        .bind(&job.description)
        .bind(MappingHelpers::data_to_json(&job.job_data)?)
        .bind(job.durable)
        .bind(job.concurrent_execution_disallowed)
        .bind(job.persist_job_data_after_execution)
        .bind(job.requests_recovery)
        .bind(&self.sched_name)
        .bind(&job.key.name)
        .bind(&job.key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_job_data(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
        data: &JobDataMap,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_jobs SET job_data = ? WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(MappingHelpers::data_to_json(data)?)
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_job(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
    ) -> SchedulerResult<Option<JobDetail>> {
        let row = sqlx::query(
            "SELECT * FROM scheduler_jobs WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(MappingHelpers::row_to_job).transpose()
    }

    pub async fn job_exists(&self, conn: &mut SqliteConnection, job_key: &JobKey) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_jobs WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn delete_job(&self, conn: &mut SqliteConnection, job_key: &JobKey) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_jobs WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_job_keys(
        &self,
        conn: &mut SqliteConnection,
        group: Option<&str>,
    ) -> SchedulerResult<Vec<JobKey>> {
        let rows = sqlx::query(
            r#"
            SELECT job_name, job_group FROM scheduler_jobs
            WHERE sched_name = ? AND (? IS NULL OR job_group = ?)
            ORDER BY job_group, job_name
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .bind(group)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter()
            .map(|row| {
                Ok(JobKey::new(
                    row.try_get::<String, _>("job_name")?,
                    row.try_get::<String, _>("job_group")?,
                ))
            })
            .collect()
    }

    pub async fn select_job_groups(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        let groups = sqlx::query_scalar(
            "SELECT DISTINCT job_group FROM scheduler_jobs WHERE sched_name = ? ORDER BY job_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(groups)
    }

    pub async fn count_jobs(&self, conn: &mut SqliteConnection) -> SchedulerResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduler_jobs WHERE sched_name = ?")
                .bind(&self.sched_name)
                .fetch_one(&mut *conn)
                .await?;
        Ok(count as usize)
    }

    // ---- 触发器 ----

    pub async fn insert_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_triggers (
                sched_name, trigger_name, trigger_group, job_name, job_group, description,
                calendar_name, job_data, priority, misfire_instruction, start_time, end_time,
                schedule, next_fire_time, prev_fire_time, times_triggered, trigger_state
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(&trigger.calendar_name)
        .bind(MappingHelpers::data_to_json(&trigger.job_data)?)
        .bind(trigger.priority)
        .bind(trigger.misfire_instruction.as_str())
        .bind(MappingHelpers::to_millis(trigger.start_time))
        .bind(MappingHelpers::opt_to_millis(trigger.end_time))
        .bind(MappingHelpers::schedule_to_json(&trigger.schedule)?)
        .bind(MappingHelpers::opt_to_millis(trigger.next_fire_time))
        .bind(MappingHelpers::opt_to_millis(trigger.previous_fire_time))
        .bind(trigger.times_triggered)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn update_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger: &Trigger,
        state: TriggerState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_triggers SET
                job_name = ?, job_group = ?, description = ?, calendar_name = ?, job_data = ?,
                priority = ?, misfire_instruction = ?, start_time = ?, end_time = ?, schedule = ?,
                next_fire_time = ?, prev_fire_time = ?, times_triggered = ?, trigger_state = ?
            WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?
            "#,
        )
        .bind(&trigger.job_key.name)
        .bind(&trigger.job_key.group)
        .bind(&trigger.description)
        .bind(&trigger.calendar_name)
        .bind(MappingHelpers::data_to_json(&trigger.job_data)?)
        .bind(trigger.priority)
        .bind(trigger.misfire_instruction.as_str())
        .bind(MappingHelpers::to_millis(trigger.start_time))
        .bind(MappingHelpers::opt_to_millis(trigger.end_time))
        .bind(MappingHelpers::schedule_to_json(&trigger.schedule)?)
        .bind(MappingHelpers::opt_to_millis(trigger.next_fire_time))
        .bind(MappingHelpers::opt_to_millis(trigger.previous_fire_time))
        .bind(trigger.times_triggered)
        .bind(state.as_str())
        .bind(&self.sched_name)
        .bind(&trigger.key.name)
        .bind(&trigger.key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<Option<Trigger>> {
        let row = sqlx::query(
            "SELECT * FROM scheduler_triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(MappingHelpers::row_to_trigger).transpose()
    }

    pub async fn trigger_exists(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn delete_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_trigger_state(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<Option<TriggerState>> {
        let state: Option<String> = sqlx::query_scalar(
            "SELECT trigger_state FROM scheduler_triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .fetch_optional(&mut *conn)
        .await?;
        state.map(|s| s.parse::<TriggerState>()).transpose()
    }

    pub async fn select_triggers_for_job(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
    ) -> SchedulerResult<Vec<Trigger>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduler_triggers
            WHERE sched_name = ? AND job_name = ? AND job_group = ?
            ORDER BY trigger_group, trigger_name
            "#,
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_trigger).collect()
    }

    pub async fn count_triggers_for_job(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
    ) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count as usize)
    }

    pub async fn select_trigger_keys(
        &self,
        conn: &mut SqliteConnection,
        group: Option<&str>,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            r#"
            SELECT trigger_name, trigger_group FROM scheduler_triggers
            WHERE sched_name = ? AND (? IS NULL OR trigger_group = ?)
            ORDER BY trigger_group, trigger_name
            "#,
        )
        .bind(&self.sched_name)
        .bind(group)
        .bind(group)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(Self::row_to_trigger_key).collect()
    }

    pub async fn select_trigger_groups(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        let groups = sqlx::query_scalar(
            "SELECT DISTINCT trigger_group FROM scheduler_triggers WHERE sched_name = ? ORDER BY trigger_group",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(groups)
    }

    pub async fn select_job_groups_with_triggers_in(
        &self,
        conn: &mut SqliteConnection,
        job_group: &str,
    ) -> SchedulerResult<Vec<String>> {
        let groups = sqlx::query_scalar(
            r#"
            SELECT DISTINCT trigger_group FROM scheduler_triggers
            WHERE sched_name = ? AND job_group = ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(job_group)
        .fetch_all(&mut *conn)
        .await?;
        Ok(groups)
    }

    pub async fn count_triggers(&self, conn: &mut SqliteConnection) -> SchedulerResult<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = ?")
                .bind(&self.sched_name)
                .fetch_one(&mut *conn)
                .await?;
        Ok(count as usize)
    }

    /// 无条件更新单个触发器状态
    pub async fn update_trigger_state(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
        new_state: TriggerState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// 条件更新：仅当当前状态在 `old_states` 中时才改为 `new_state`，返回受影响行数
    pub async fn update_trigger_state_from(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let sql = format!(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ? AND trigger_state IN ({})",
            Self::placeholders(old_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(new_state.as_str())
            .bind(&self.sched_name)
            .bind(&trigger_key.name)
            .bind(&trigger_key.group);
        for state in old_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    pub async fn update_trigger_group_state_from(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let sql = format!(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_group = ? AND trigger_state IN ({})",
            Self::placeholders(old_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(new_state.as_str())
            .bind(&self.sched_name)
            .bind(group);
        for state in old_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    pub async fn update_job_triggers_state_from(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let sql = format!(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND job_name = ? AND job_group = ? AND trigger_state IN ({})",
            Self::placeholders(old_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(new_state.as_str())
            .bind(&self.sched_name)
            .bind(&job_key.name)
            .bind(&job_key.group);
        for state in old_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    pub async fn update_job_triggers_state(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
        new_state: TriggerState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(new_state.as_str())
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn update_all_triggers_state_from(
        &self,
        conn: &mut SqliteConnection,
        new_state: TriggerState,
        old_states: &[TriggerState],
    ) -> SchedulerResult<u64> {
        let sql = format!(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_state IN ({})",
            Self::placeholders(old_states.len())
        );
        let mut query = sqlx::query(&sql)
            .bind(new_state.as_str())
            .bind(&self.sched_name);
        for state in old_states {
            query = query.bind(state.as_str());
        }
        Ok(query.execute(&mut *conn).await?.rows_affected())
    }

    /// 没有下一次触发时间的触发器不会再触发，直接标记为完成
    pub async fn complete_triggers_without_next_fire_time(
        &self,
        conn: &mut SqliteConnection,
        old_state: TriggerState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "UPDATE scheduler_triggers SET trigger_state = ? WHERE sched_name = ? AND trigger_state = ? AND next_fire_time IS NULL",
        )
        .bind(TriggerState::Complete.as_str())
        .bind(&self.sched_name)
        .bind(old_state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_trigger_keys_in_state(
        &self,
        conn: &mut SqliteConnection,
        state: TriggerState,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        let rows = sqlx::query(
            "SELECT trigger_name, trigger_group FROM scheduler_triggers WHERE sched_name = ? AND trigger_state = ?",
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(Self::row_to_trigger_key).collect()
    }

    pub async fn select_trigger_keys_in_group(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
    ) -> SchedulerResult<Vec<TriggerKey>> {
        self.select_trigger_keys(conn, Some(group)).await
    }

    pub async fn delete_triggers_in_state(
        &self,
        conn: &mut SqliteConnection,
        state: TriggerState,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_triggers WHERE sched_name = ? AND trigger_state = ?",
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    /// 获取候选：WAITING、下一次触发时间不晚于 `no_later_than`，
    /// 且未错过（或策略为忽略补火），按时间升序、优先级降序
    pub async fn select_triggers_to_acquire(
        &self,
        conn: &mut SqliteConnection,
        no_later_than: DateTime<Utc>,
        no_earlier_than: DateTime<Utc>,
        limit: usize,
    ) -> SchedulerResult<Vec<Trigger>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduler_triggers
            WHERE sched_name = ? AND trigger_state = ?
              AND next_fire_time IS NOT NULL AND next_fire_time <= ?
              AND (misfire_instruction = ? OR next_fire_time >= ?)
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(TriggerState::Waiting.as_str())
        .bind(MappingHelpers::to_millis(no_later_than))
        .bind(MisfireInstruction::IgnoreMisfirePolicy.as_str())
        .bind(MappingHelpers::to_millis(no_earlier_than))
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_trigger).collect()
    }

    pub async fn count_misfired_triggers_in_state(
        &self,
        conn: &mut SqliteConnection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
    ) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM scheduler_triggers
            WHERE sched_name = ? AND trigger_state = ? AND misfire_instruction <> ?
              AND next_fire_time IS NOT NULL AND next_fire_time < ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .bind(MisfireInstruction::IgnoreMisfirePolicy.as_str())
        .bind(MappingHelpers::to_millis(misfire_time))
        .fetch_one(&mut *conn)
        .await?;
        Ok(count as usize)
    }

    /// 已错过的触发器；`limit` 为 None 时不限数量
    pub async fn select_misfired_triggers_in_state(
        &self,
        conn: &mut SqliteConnection,
        state: TriggerState,
        misfire_time: DateTime<Utc>,
        limit: Option<usize>,
    ) -> SchedulerResult<Vec<Trigger>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM scheduler_triggers
            WHERE sched_name = ? AND trigger_state = ? AND misfire_instruction <> ?
              AND next_fire_time IS NOT NULL AND next_fire_time < ?
            ORDER BY next_fire_time ASC, priority DESC
            LIMIT ?
            "#,
        )
        .bind(&self.sched_name)
        .bind(state.as_str())
        .bind(MisfireInstruction::IgnoreMisfirePolicy.as_str())
        .bind(MappingHelpers::to_millis(misfire_time))
        .bind(limit.map(|l| l as i64).unwrap_or(-1))
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_trigger).collect()
    }

    pub async fn select_triggers_for_calendar(
        &self,
        conn: &mut SqliteConnection,
        calendar_name: &str,
    ) -> SchedulerResult<Vec<Trigger>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_triggers WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(calendar_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_trigger).collect()
    }

    pub async fn calendar_is_referenced(
        &self,
        conn: &mut SqliteConnection,
        calendar_name: &str,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_triggers WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(calendar_name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    // ---- 已触发记录 ----

    pub async fn insert_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        record: &FiredTriggerRecord,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_fired_triggers (
                sched_name, entry_id, trigger_name, trigger_group, job_name, job_group,
                instance_id, fired_time, sched_time, priority, state, is_nonconcurrent, requests_recovery
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&self.sched_name)
        .bind(&record.fire_instance_id)
        .bind(&record.trigger_key.name)
        .bind(&record.trigger_key.group)
        .bind(&record.job_key.name)
        .bind(&record.job_key.group)
        .bind(&record.instance_id)
        .bind(MappingHelpers::to_millis(record.fired_at))
        .bind(MappingHelpers::to_millis(record.scheduled_at))
        .bind(record.priority)
        .bind(record.state.as_str())
        .bind(record.concurrent_execution_disallowed)
        .bind(record.requests_recovery)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// 触发时刷新记录：状态、触发时间以及作业标志
    pub async fn update_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        record: &FiredTriggerRecord,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE scheduler_fired_triggers SET
                instance_id = ?, fired_time = ?, sched_time = ?, state = ?,
                job_name = ?, job_group = ?, is_nonconcurrent = ?, requests_recovery = ?
            WHERE sched_name = ? AND entry_id = ?
            "#,
        )
        .bind(&record.instance_id)
        .bind(MappingHelpers::to_millis(record.fired_at))
        .bind(MappingHelpers::to_millis(record.scheduled_at))
        .bind(record.state.as_str())
        .bind(&record.job_key.name)
        .bind(&record.job_key.group)
        .bind(record.concurrent_execution_disallowed)
        .bind(record.requests_recovery)
        .bind(&self.sched_name)
        .bind(&record.fire_instance_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_fired_trigger(
        &self,
        conn: &mut SqliteConnection,
        entry_id: &str,
    ) -> SchedulerResult<Option<FiredTriggerRecord>> {
        let row = sqlx::query(
            "SELECT * FROM scheduler_fired_triggers WHERE sched_name = ? AND entry_id = ?",
        )
        .bind(&self.sched_name)
        .bind(entry_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(MappingHelpers::row_to_fired_record).transpose()
    }

    pub async fn delete_fired_trigger(&self, conn: &mut SqliteConnection, entry_id: &str) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_fired_triggers WHERE sched_name = ? AND entry_id = ?",
        )
        .bind(&self.sched_name)
        .bind(entry_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_fired_triggers_for_instance(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_fired_triggers WHERE sched_name = ? AND instance_id = ? ORDER BY fired_time",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_fired_record).collect()
    }

    pub async fn select_fired_triggers_for_trigger(
        &self,
        conn: &mut SqliteConnection,
        trigger_key: &TriggerKey,
    ) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_fired_triggers WHERE sched_name = ? AND trigger_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&trigger_key.name)
        .bind(&trigger_key.group)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_fired_record).collect()
    }

    pub async fn count_fired_triggers_for_job(
        &self,
        conn: &mut SqliteConnection,
        job_key: &JobKey,
    ) -> SchedulerResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_fired_triggers WHERE sched_name = ? AND job_name = ? AND job_group = ?",
        )
        .bind(&self.sched_name)
        .bind(&job_key.name)
        .bind(&job_key.group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count as usize)
    }

    pub async fn select_all_fired_triggers(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<FiredTriggerRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_fired_triggers WHERE sched_name = ? ORDER BY fired_time",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_fired_record).collect()
    }

    pub async fn select_fired_trigger_instance_ids(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT DISTINCT instance_id FROM scheduler_fired_triggers WHERE sched_name = ?",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    pub async fn delete_fired_triggers_for_instance(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_fired_triggers WHERE sched_name = ? AND instance_id = ?",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_all_fired_triggers(&self, conn: &mut SqliteConnection) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM scheduler_fired_triggers WHERE sched_name = ?")
            .bind(&self.sched_name)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- 日历 ----

    pub async fn upsert_calendar(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
        calendar: &Calendar,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_calendars (sched_name, calendar_name, calendar) VALUES (?, ?, ?)
            ON CONFLICT (sched_name, calendar_name) DO UPDATE SET calendar = excluded.calendar
            "#,
        )
        .bind(&self.sched_name)
        .bind(name)
        .bind(MappingHelpers::calendar_to_json(calendar)?)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_calendar(
        &self,
        conn: &mut SqliteConnection,
        name: &str,
    ) -> SchedulerResult<Option<Calendar>> {
        let row = sqlx::query(
            "SELECT calendar FROM scheduler_calendars WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(MappingHelpers::row_to_calendar).transpose()
    }

    pub async fn calendar_exists(&self, conn: &mut SqliteConnection, name: &str) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_calendars WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn delete_calendar(&self, conn: &mut SqliteConnection, name: &str) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_calendars WHERE sched_name = ? AND calendar_name = ?",
        )
        .bind(&self.sched_name)
        .bind(name)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn select_calendar_names(&self, conn: &mut SqliteConnection) -> SchedulerResult<Vec<String>> {
        let names = sqlx::query_scalar(
            "SELECT calendar_name FROM scheduler_calendars WHERE sched_name = ? ORDER BY calendar_name",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(names)
    }

    // ---- 暂停分组 ----

    pub async fn insert_paused_trigger_group(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
    ) -> SchedulerResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO scheduler_paused_trigger_groups (sched_name, trigger_group) VALUES (?, ?)",
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn delete_paused_trigger_group(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_paused_trigger_groups WHERE sched_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(group)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn is_trigger_group_paused(
        &self,
        conn: &mut SqliteConnection,
        group: &str,
    ) -> SchedulerResult<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scheduler_paused_trigger_groups WHERE sched_name = ? AND trigger_group = ?",
        )
        .bind(&self.sched_name)
        .bind(group)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    pub async fn select_paused_trigger_groups(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<String>> {
        let groups = sqlx::query_scalar(
            "SELECT trigger_group FROM scheduler_paused_trigger_groups WHERE sched_name = ?",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        Ok(groups)
    }

    pub async fn delete_all_paused_trigger_groups(&self, conn: &mut SqliteConnection) -> SchedulerResult<u64> {
        let result = sqlx::query("DELETE FROM scheduler_paused_trigger_groups WHERE sched_name = ?")
            .bind(&self.sched_name)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- 实例心跳 ----

    pub async fn upsert_scheduler_state(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
        checkin_time: DateTime<Utc>,
        checkin_interval_ms: i64,
    ) -> SchedulerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduler_state (sched_name, instance_id, last_checkin_time, checkin_interval)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (sched_name, instance_id) DO UPDATE SET
                last_checkin_time = excluded.last_checkin_time,
                checkin_interval = excluded.checkin_interval
            "#,
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .bind(MappingHelpers::to_millis(checkin_time))
        .bind(checkin_interval_ms)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn select_scheduler_states(
        &self,
        conn: &mut SqliteConnection,
    ) -> SchedulerResult<Vec<SchedulerStateRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM scheduler_state WHERE sched_name = ? ORDER BY instance_id",
        )
        .bind(&self.sched_name)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(MappingHelpers::row_to_state_record).collect()
    }

    pub async fn delete_scheduler_state(
        &self,
        conn: &mut SqliteConnection,
        instance_id: &str,
    ) -> SchedulerResult<u64> {
        let result = sqlx::query(
            "DELETE FROM scheduler_state WHERE sched_name = ? AND instance_id = ?",
        )
        .bind(&self.sched_name)
        .bind(instance_id)
        .execute(&mut *conn)
        .await?;
        Ok(result.rows_affected())
    }

    // ---- 清空 ----

    /// 删除全部作业、触发器、日历和暂停分组；已触发记录保留给正在执行的作业完成
    pub async fn clear_data(&self, conn: &mut SqliteConnection) -> SchedulerResult<()> {
        for table in [
            "scheduler_triggers",
            "scheduler_jobs",
            "scheduler_calendars",
            "scheduler_paused_trigger_groups",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE sched_name = ?"))
                .bind(&self.sched_name)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    fn row_to_trigger_key(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TriggerKey> {
        Ok(TriggerKey::new(
            row.try_get::<String, _>("trigger_name")?,
            row.try_get::<String, _>("trigger_group")?,
        ))
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count.max(1)].join(", ")
    }
}

/// 触发时写入的已触发记录
pub fn new_fired_record(
    fire_instance_id: String,
    trigger: &Trigger,
    job: Option<&JobDetail>,
    instance_id: &str,
    fired_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    state: FiredTriggerState,
) -> FiredTriggerRecord {
    FiredTriggerRecord {
        fire_instance_id,
        trigger_key: trigger.key.clone(),
        job_key: trigger.job_key.clone(),
        instance_id: instance_id.to_string(),
        fired_at,
        scheduled_at,
        priority: trigger.priority,
        state,
        concurrent_execution_disallowed: job.map(|j| j.concurrent_execution_disallowed).unwrap_or(false),
        requests_recovery: job.map(|j| j.requests_recovery).unwrap_or(false),
    }
}
