use crate::config::models::{AppConfig, LockHandlerKind};

#[test]
fn test_semaphore_lock_rejected_when_clustered() {
    let mut config = AppConfig::default();
    config.job_store.clustered = true;
    config.job_store.lock_handler = LockHandlerKind::Semaphore;
    assert!(config.validate().is_err());

    config.job_store.clustered = false;
    assert!(config.validate().is_ok());
}

#[test]
fn test_invalid_values() {
    let mut config = AppConfig::default();
    config.thread_pool.thread_count = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.job_store.url = "postgres://localhost/db".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.job_store.misfire_threshold_ms = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.scheduler.batch_trigger_acquisition_max_count = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.observability.log_level = "verbose".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.observability.metrics_listen_address = Some("not-an-address".to_string());
    assert!(config.validate().is_err());
}

#[test]
fn test_clustered_requires_file_database() {
    let mut config = AppConfig::default();
    config.job_store.clustered = true;
    config.job_store.url = "sqlite::memory:".to_string();
    assert!(config.validate().is_err());

    config.job_store.url = "sqlite://cluster.db".to_string();
    assert!(config.validate().is_ok());
}

#[test]
fn test_interval_upper_bounds() {
    use crate::config::models::{bounded_millis, MAX_INTERVAL_MS};

    let mut config = AppConfig::default();
    config.job_store.misfire_threshold_ms = MAX_INTERVAL_MS;
    assert!(config.validate().is_ok());
    config.job_store.misfire_threshold_ms = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.job_store.clustered = true;
    config.job_store.cluster_checkin_interval_ms = MAX_INTERVAL_MS + 1;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.job_store.retry_interval_ms = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.job_store.connection_timeout_seconds = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.scheduler.idle_wait_time_ms = u64::MAX;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.scheduler.batch_trigger_acquisition_fire_ahead_time_window_ms = 1 << 63;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.scheduler.db_failure_retry_interval_ms = MAX_INTERVAL_MS + 1;
    assert!(config.validate().is_err());

    // 未经校验的超大值在换算时截断，不会变成负数
    assert_eq!(
        bounded_millis(u64::MAX).num_milliseconds(),
        MAX_INTERVAL_MS as i64
    );
    assert_eq!(bounded_millis(1_500).num_milliseconds(), 1_500);
}
