use std::io::Write;

use crate::config::models::{AppConfig, LockHandlerKind, LogFormat, TransactionMode};

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.scheduler.idle_wait_time_ms, 30_000);
    assert_eq!(config.scheduler.batch_trigger_acquisition_max_count, 1);
    assert_eq!(config.thread_pool.thread_count, 10);
    assert_eq!(config.job_store.misfire_threshold_ms, 60_000);
    assert_eq!(config.job_store.cluster_checkin_interval_ms, 7_500);
    assert_eq!(config.job_store.lock_handler, LockHandlerKind::Database);
    assert_eq!(config.job_store.transaction_mode, TransactionMode::SelfManaged);
    assert!(!config.job_store.clustered);
}

#[test]
fn test_config_from_toml() {
    let toml_content = r#"
[scheduler]
name = "TestScheduler"
instance_id = "node-1"
batch_trigger_acquisition_max_count = 5

[thread_pool]
thread_count = 4

[job_store]
url = "sqlite://test.db"
clustered = true
misfire_threshold_ms = 5000
transaction_mode = "caller_managed"

[observability]
log_level = "debug"
log_format = "json"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert_eq!(config.scheduler.name, "TestScheduler");
    assert_eq!(config.scheduler.resolve_instance_id(), "node-1");
    assert_eq!(config.scheduler.batch_trigger_acquisition_max_count, 5);
    assert_eq!(config.thread_pool.thread_count, 4);
    assert!(config.job_store.clustered);
    assert_eq!(config.job_store.misfire_threshold_ms, 5_000);
    assert_eq!(
        config.job_store.transaction_mode,
        TransactionMode::CallerManaged
    );
    // 未出现的字段使用默认值
    assert_eq!(config.job_store.max_misfires_to_handle_at_a_time, 20);
    assert_eq!(config.observability.log_format, LogFormat::Json);
}

#[test]
fn test_toml_round_trip() {
    let config = AppConfig::default();
    let toml_str = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&toml_str).unwrap();
    assert_eq!(parsed.scheduler.name, config.scheduler.name);
    assert_eq!(parsed.job_store.url, config.job_store.url);
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[scheduler]
name = "FileScheduler"

[job_store]
url = "sqlite://file.db"
retry_attempts = 7
"#
    )
    .unwrap();

    let config = AppConfig::load(Some(file.path().to_str().unwrap())).unwrap();
    assert_eq!(config.scheduler.name, "FileScheduler");
    assert_eq!(config.job_store.retry_attempts, 7);
    assert_eq!(config.thread_pool.thread_count, 10);
}

#[test]
fn test_load_missing_file_fails() {
    assert!(AppConfig::load(Some("/definitely/not/here.toml")).is_err());
}

#[test]
fn test_auto_instance_id() {
    let config = AppConfig::default();
    let a = config.scheduler.resolve_instance_id();
    assert!(!a.is_empty());
    assert_ne!(a, "AUTO");
}
