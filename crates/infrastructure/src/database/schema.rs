//! 作业存储的表结构
//!
//! 所有表都带 `sched_name` 列，多个调度器可以共用一个数据库；时间统一存为毫秒时间戳。

use sqlx::SqlitePool;
use tracing::debug;

use scheduler_errors::SchedulerResult;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_jobs (
        sched_name TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        job_type TEXT NOT NULL,
        description TEXT,
        job_data TEXT NOT NULL DEFAULT '{}',
        is_durable INTEGER NOT NULL DEFAULT 0,
        is_nonconcurrent INTEGER NOT NULL DEFAULT 0,
        is_update_data INTEGER NOT NULL DEFAULT 0,
        requests_recovery INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (sched_name, job_name, job_group)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_triggers (
        sched_name TEXT NOT NULL,
        trigger_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        description TEXT,
        calendar_name TEXT,
        job_data TEXT NOT NULL DEFAULT '{}',
        priority INTEGER NOT NULL DEFAULT 5,
        misfire_instruction TEXT NOT NULL,
        start_time INTEGER NOT NULL,
        end_time INTEGER,
        schedule TEXT NOT NULL,
        next_fire_time INTEGER,
        prev_fire_time INTEGER,
        times_triggered INTEGER NOT NULL DEFAULT 0,
        trigger_state TEXT NOT NULL,
        PRIMARY KEY (sched_name, trigger_name, trigger_group)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_fired_triggers (
        sched_name TEXT NOT NULL,
        entry_id TEXT NOT NULL,
        trigger_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        job_name TEXT NOT NULL,
        job_group TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        fired_time INTEGER NOT NULL,
        sched_time INTEGER NOT NULL,
        priority INTEGER NOT NULL,
        state TEXT NOT NULL,
        is_nonconcurrent INTEGER NOT NULL DEFAULT 0,
        requests_recovery INTEGER NOT NULL DEFAULT 0,
        PRIMARY KEY (sched_name, entry_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_calendars (
        sched_name TEXT NOT NULL,
        calendar_name TEXT NOT NULL,
        calendar TEXT NOT NULL,
        PRIMARY KEY (sched_name, calendar_name)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_paused_trigger_groups (
        sched_name TEXT NOT NULL,
        trigger_group TEXT NOT NULL,
        PRIMARY KEY (sched_name, trigger_group)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_state (
        sched_name TEXT NOT NULL,
        instance_id TEXT NOT NULL,
        last_checkin_time INTEGER NOT NULL,
        checkin_interval INTEGER NOT NULL,
        PRIMARY KEY (sched_name, instance_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduler_locks (
        sched_name TEXT NOT NULL,
        lock_name TEXT NOT NULL,
        lock_owner TEXT,
        acquired_at INTEGER,
        PRIMARY KEY (sched_name, lock_name)
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_sched_triggers_state_next ON scheduler_triggers(sched_name, trigger_state, next_fire_time)",
    "CREATE INDEX IF NOT EXISTS idx_sched_triggers_job ON scheduler_triggers(sched_name, job_name, job_group)",
    "CREATE INDEX IF NOT EXISTS idx_sched_triggers_calendar ON scheduler_triggers(sched_name, calendar_name)",
    "CREATE INDEX IF NOT EXISTS idx_sched_fired_instance ON scheduler_fired_triggers(sched_name, instance_id)",
    "CREATE INDEX IF NOT EXISTS idx_sched_fired_job ON scheduler_fired_triggers(sched_name, job_name, job_group)",
    "CREATE INDEX IF NOT EXISTS idx_sched_fired_trigger ON scheduler_fired_triggers(sched_name, trigger_name, trigger_group)",
];

/// 运行数据库迁移（幂等）
pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
    debug!("Running job store migrations");
    for statement in TABLES.iter().chain(INDEXES.iter()) {
        sqlx::query(statement).execute(pool).await?;
    }
    debug!("Job store migrations completed");
    Ok(())
}
