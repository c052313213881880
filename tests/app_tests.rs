use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;

use clustered_scheduler::{init_schema, Application, ShutdownManager, LOG_JOB_TYPE};
use scheduler_core::AppConfig;
use scheduler_domain::{JobDetail, JobKey};

fn node_config(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.scheduler.instance_id = "app-node".to_string();
    config.scheduler.idle_wait_time_ms = 200;
    config.thread_pool.thread_count = 2;
    config.job_store.url = format!("sqlite://{}", dir.path().join("app.db").display());
    config.job_store.max_connections = 2;
    config.observability.metrics_enabled = false;
    config
}

#[tokio::test]
async fn test_init_schema_creates_tables() {
    let dir = TempDir::new().unwrap();
    let config = node_config(&dir);
    init_schema(&config).await.unwrap();
    // 重复执行不报错
    init_schema(&config).await.unwrap();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&config.job_store.url)
        .await
        .unwrap();
    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'scheduler_%' ORDER BY name",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    let names: Vec<String> = tables.into_iter().map(|(name,)| name).collect();
    for expected in [
        "scheduler_calendars",
        "scheduler_fired_triggers",
        "scheduler_jobs",
        "scheduler_locks",
        "scheduler_paused_trigger_groups",
        "scheduler_state",
        "scheduler_triggers",
    ] {
        assert!(names.iter().any(|n| n == expected), "缺少表 {expected}");
    }
    pool.close().await;
}

#[tokio::test]
async fn test_application_runs_log_job_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let app = std::sync::Arc::new(Application::new(node_config(&dir)).await.unwrap());
    assert!(app.scheduler().job_registry().contains(LOG_JOB_TYPE).await);

    let shutdown = ShutdownManager::new();
    let rx = shutdown.subscribe();
    let handle = {
        let app = app.clone();
        tokio::spawn(async move { app.run(rx).await })
    };

    let scheduler = app.scheduler();
    for _ in 0..50 {
        if scheduler.is_started() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(scheduler.is_started());

    let job_key = JobKey::with_default_group("greeting");
    scheduler
        .add_job(
            JobDetail::new(job_key.clone(), LOG_JOB_TYPE)
                .with_durable(true)
                .with_data("message", "hello"),
            false,
        )
        .await
        .unwrap();
    scheduler.trigger_job(&job_key, None).await.unwrap();

    let mut executed = 0;
    for _ in 0..100 {
        executed = scheduler.metadata().await.jobs_executed;
        if executed >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(executed, 1);

    shutdown.shutdown();
    handle.await.unwrap().unwrap();
    assert!(scheduler.is_shutdown());
}

#[tokio::test]
async fn test_application_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = node_config(&dir);
    config.thread_pool.thread_count = 0;
    assert!(Application::new(config).await.is_err());
}
