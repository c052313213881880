use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tempfile::TempDir;

use scheduler_core::config::JobStoreConfig;
use scheduler_core::SchedulerMetrics;
use scheduler_domain::{
    now_millis, Calendar, CompletedExecutionInstruction, JobDetail, JobKey, JobStore,
    MisfireInstruction, NoopSignaler, Schedule, Trigger, TriggerFiredResult, TriggerKey,
    TriggerState, RECOVERING_JOBS_GROUP, RECOVERY_ORIGINAL_TRIGGER_NAME, REPEAT_INDEFINITELY,
};
use scheduler_errors::SchedulerError;
use scheduler_infrastructure::{DatabaseManager, JobStoreOptions, SqlJobStore};

fn db_url(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("scheduler.db").display())
}

async fn open_store(dir: &TempDir, instance_id: &str, clustered: bool) -> SqlJobStore {
    open_store_with_metrics(dir, instance_id, clustered, SchedulerMetrics::new()).await
}

async fn open_store_with_metrics(
    dir: &TempDir,
    instance_id: &str,
    clustered: bool,
    metrics: SchedulerMetrics,
) -> SqlJobStore {
    let url = db_url(dir);
    let db = DatabaseManager::new(&url, 4, StdDuration::from_secs(5))
        .await
        .unwrap();
    let config = JobStoreConfig {
        url,
        clustered,
        misfire_threshold_ms: 1_000,
        ..Default::default()
    };
    let options = JobStoreOptions::from_config("TestScheduler", instance_id, &config);
    let store = SqlJobStore::new(db, options).with_metrics(metrics);
    store.initialize(Arc::new(NoopSignaler)).await.unwrap();
    store
}

/// 绑定到独立 Prometheus 记录器的指标，便于读回计数
fn recorded_metrics() -> (SchedulerMetrics, PrometheusHandle) {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let metrics = metrics::with_local_recorder(&recorder, SchedulerMetrics::new);
    (metrics, handle)
}

fn counter_value(handle: &PrometheusHandle, name: &str) -> u64 {
    let rendered = handle.render();
    rendered
        .lines()
        .filter_map(|line| line.strip_prefix(name)?.strip_prefix(' '))
        .map(|value| value.trim().parse::<f64>().unwrap() as u64)
        .next()
        .unwrap_or(0)
}

fn job(name: &str) -> JobDetail {
    JobDetail::new(JobKey::with_default_group(name), "log")
}

/// 已计算首次触发时间的触发器
fn due_trigger(name: &str, job_key: &JobKey, schedule: Schedule, start_offset_ms: i64) -> Trigger {
    let mut trigger = Trigger::new(TriggerKey::with_default_group(name), job_key.clone(), schedule)
        .with_start_time(now_millis() + Duration::milliseconds(start_offset_ms));
    trigger.compute_first_fire_time(None);
    trigger
}

fn fired_bundle(results: Vec<TriggerFiredResult>) -> Vec<Trigger> {
    results
        .into_iter()
        .map(|r| match r {
            TriggerFiredResult::Fired(bundle) => bundle.trigger,
            TriggerFiredResult::Failed { error, .. } => panic!("触发失败: {error}"),
        })
        .collect()
}

#[tokio::test]
async fn test_store_rejects_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("report");
    let trigger = due_trigger("t1", &job.key, Schedule::once(), 60_000);

    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let err = store.store_job(&job, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));
    let err = store.store_trigger(&trigger, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));

    store.store_job(&job.clone().with_description("updated"), true).await.unwrap();
    let stored = store.retrieve_job(&job.key).await.unwrap().unwrap();
    assert_eq!(stored.description.as_deref(), Some("updated"));
    assert_eq!(store.get_number_of_jobs().await.unwrap(), 1);
    assert_eq!(store.get_number_of_triggers().await.unwrap(), 1);
}

#[tokio::test]
async fn test_trigger_for_missing_job_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let trigger = due_trigger("t1", &JobKey::with_default_group("ghost"), Schedule::once(), 0);

    let err = store.store_trigger(&trigger, false).await.unwrap_err();
    assert!(matches!(err, SchedulerError::JobNotFound { .. }));
}

#[tokio::test]
async fn test_acquire_fire_complete_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("cycle");
    let trigger = due_trigger(
        "every-minute",
        &job.key,
        Schedule::simple(60_000, REPEAT_INDEFINITELY),
        -10,
    );
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert!(acquired[0].fire_instance_id.is_some());
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Acquired)
    );
    assert_eq!(store.get_fired_trigger_records().await.unwrap().len(), 1);

    let fired = fired_bundle(store.triggers_fired(&acquired).await.unwrap());
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].times_triggered, 1);
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Executing)
    );

    let completed = store
        .triggered_job_complete(&fired[0], &job, CompletedExecutionInstruction::Noop)
        .await
        .unwrap();
    assert!(completed);
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());

    // 第二次完成没有对应的已触发记录
    let again = store
        .triggered_job_complete(&fired[0], &job, CompletedExecutionInstruction::Noop)
        .await
        .unwrap();
    assert!(!again);
}

#[tokio::test]
async fn test_release_acquired_trigger_returns_to_waiting() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("release");
    let trigger = due_trigger("t1", &job.key, Schedule::once(), 0);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    store.release_acquired_trigger(&acquired[0]).await.unwrap();

    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_one_shot_trigger_is_deleted_with_non_durable_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("once");
    let trigger = due_trigger("t1", &job.key, Schedule::once(), 0);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    let fired = fired_bundle(store.triggers_fired(&acquired).await.unwrap());
    assert!(fired[0].next_fire_time.is_none());

    let instruction = fired[0].execution_complete(None);
    assert_eq!(instruction, CompletedExecutionInstruction::DeleteTrigger);
    store
        .triggered_job_complete(&fired[0], &job, instruction)
        .await
        .unwrap();

    assert!(!store.check_trigger_exists(&trigger.key).await.unwrap());
    assert!(!store.check_job_exists(&job.key).await.unwrap());
}

#[tokio::test]
async fn test_non_concurrent_job_blocks_sibling_triggers() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("exclusive").with_concurrent_execution_disallowed(true);
    let first = due_trigger("first", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), -20);
    let second = due_trigger("second", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), -10);
    store.store_job_and_trigger(&job, &first).await.unwrap();
    store.store_trigger(&second, false).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 5, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1, "同一个不允许并发的作业一批只获取一次");
    assert_eq!(acquired[0].key, first.key);

    let fired = fired_bundle(store.triggers_fired(&acquired).await.unwrap());
    assert_eq!(
        store.get_trigger_state(&second.key).await.unwrap(),
        Some(TriggerState::Blocked)
    );

    // 执行期间再次获取不会拿到被阻塞的触发器
    let none = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 5, Duration::zero())
        .await
        .unwrap();
    assert!(none.is_empty());

    store
        .triggered_job_complete(&fired[0], &job, CompletedExecutionInstruction::Noop)
        .await
        .unwrap();
    assert_eq!(
        store.get_trigger_state(&second.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
}

#[tokio::test]
async fn test_persist_job_data_after_execution() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("counter")
        .with_data("count", 0)
        .with_persist_job_data_after_execution(true);
    let trigger = due_trigger("t1", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), 0);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    let fired = fired_bundle(store.triggers_fired(&acquired).await.unwrap());

    let updated = job.clone().with_data("count", 1);
    store
        .triggered_job_complete(&fired[0], &updated, CompletedExecutionInstruction::Noop)
        .await
        .unwrap();
    let stored = store.retrieve_job(&job.key).await.unwrap().unwrap();
    assert_eq!(stored.job_data["count"], 1);
}

#[tokio::test]
async fn test_misfired_trigger_fires_now_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("late");
    let mut trigger = Trigger::new(TriggerKey::with_default_group("late"), job.key.clone(), Schedule::once())
        .with_start_time(now_millis() - Duration::seconds(5))
        .with_misfire_instruction(MisfireInstruction::FireNow);
    trigger.compute_first_fire_time(None);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    // 太晚的触发器不会被直接获取
    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    assert!(acquired.is_empty());

    let before = now_millis();
    let scan = store.recover_misfired_triggers().await.unwrap();
    assert_eq!(scan.processed, 1);
    assert!(!scan.has_more);

    let stored = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
    let next = stored.next_fire_time.unwrap();
    assert!(next >= before);

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);

    let again = store.recover_misfired_triggers().await.unwrap();
    assert_eq!(again.processed, 0);
}

#[tokio::test]
async fn test_store_counts_acquired_and_misfired_triggers_once() {
    let dir = tempfile::tempdir().unwrap();
    let (metrics, handle) = recorded_metrics();
    let store = open_store_with_metrics(&dir, "node-a", false, metrics).await;

    let ready = job("ready");
    let trigger = due_trigger("ready", &ready.key, Schedule::once(), 0);
    store.store_job_and_trigger(&ready, &trigger).await.unwrap();
    let late = job("late");
    let mut missed = Trigger::new(TriggerKey::with_default_group("late"), late.key.clone(), Schedule::once())
        .with_start_time(now_millis() - Duration::seconds(5))
        .with_misfire_instruction(MisfireInstruction::FireNow);
    missed.compute_first_fire_time(None);
    store.store_job_and_trigger(&late, &missed).await.unwrap();

    let acquired = store
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 5, Duration::zero())
        .await
        .unwrap();
    assert_eq!(acquired.len(), 1);
    assert_eq!(counter_value(&handle, "scheduler_triggers_acquired_total"), 1);

    let scan = store.recover_misfired_triggers().await.unwrap();
    assert_eq!(scan.processed, 1);
    assert_eq!(counter_value(&handle, "scheduler_misfires_handled_total"), 1);
}

#[tokio::test]
async fn test_replaced_calendar_updates_stored_trigger() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let empty: [NaiveDate; 0] = [];
    store
        .store_calendar("maintenance", &Calendar::holiday(empty), false, false)
        .await
        .unwrap();

    let job = job("per-second");
    let mut trigger = Trigger::new(
        TriggerKey::with_default_group("per-second"),
        job.key.clone(),
        Schedule::simple(1_000, REPEAT_INDEFINITELY),
    )
    .with_start_time(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
    .with_calendar("maintenance");
    trigger.compute_first_fire_time(None);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    // 一周的排除区间远大于触发间隔
    let week = Calendar::holiday((1..=7).map(|d| NaiveDate::from_ymd_opt(2030, 1, d).unwrap()));
    store.store_calendar("maintenance", &week, true, true).await.unwrap();

    let stored = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
    assert_eq!(
        stored.next_fire_time,
        Some(Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 0).unwrap())
    );
    assert_eq!(stored.state, TriggerState::Waiting);

    // 不更新触发器时保留原有的下一次触发时间
    let cleared: [NaiveDate; 0] = [];
    store
        .store_calendar("maintenance", &Calendar::holiday(cleared), true, false)
        .await
        .unwrap();
    let stored = store.retrieve_trigger(&trigger.key).await.unwrap().unwrap();
    assert_eq!(
        stored.next_fire_time,
        Some(Utc.with_ymd_and_hms(2030, 1, 8, 0, 0, 0).unwrap())
    );
}

#[tokio::test]
async fn test_pause_and_resume_trigger_group() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("paused").with_durable(true);
    let trigger = due_trigger("t1", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), 60_000);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    store.pause_trigger_group("DEFAULT").await.unwrap();
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Paused)
    );
    assert!(store.get_paused_trigger_groups().await.unwrap().contains("DEFAULT"));

    // 暂停分组中新加入的触发器直接处于暂停状态
    let late_comer = due_trigger("t2", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), 60_000);
    store.store_trigger(&late_comer, false).await.unwrap();
    assert_eq!(
        store.get_trigger_state(&late_comer.key).await.unwrap(),
        Some(TriggerState::Paused)
    );

    store.resume_trigger_group("DEFAULT").await.unwrap();
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert_eq!(
        store.get_trigger_state(&late_comer.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.get_paused_trigger_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_pause_all_applies_to_new_groups() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("all").with_durable(true);
    store.store_job(&job, false).await.unwrap();

    store.pause_all().await.unwrap();
    let mut trigger = Trigger::new(
        TriggerKey::new("t1", "reports"),
        job.key.clone(),
        Schedule::simple(60_000, REPEAT_INDEFINITELY),
    );
    trigger.compute_first_fire_time(None);
    store.store_trigger(&trigger, false).await.unwrap();
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Paused)
    );
    let paused = store.get_paused_trigger_groups().await.unwrap();
    assert!(paused.contains("reports"));
    assert_eq!(paused.len(), 1);

    store.resume_all().await.unwrap();
    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.get_paused_trigger_groups().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_referenced_calendar_cannot_be_removed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let holidays = Calendar::holiday([NaiveDate::from_ymd_opt(2030, 1, 1).unwrap()]);
    store.store_calendar("holidays", &holidays, false, false).await.unwrap();
    let err = store
        .store_calendar("holidays", &holidays, false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));

    let job = job("cal");
    let trigger = due_trigger("t1", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), 60_000)
        .with_calendar("holidays");
    store.store_job_and_trigger(&job, &trigger).await.unwrap();

    let err = store.remove_calendar("holidays").await.unwrap_err();
    assert!(matches!(err, SchedulerError::ValidationError(_)));

    store.remove_trigger(&trigger.key).await.unwrap();
    assert!(store.remove_calendar("holidays").await.unwrap());
    assert!(store.get_calendar_names().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_replace_trigger_requires_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", false).await;
    let job = job("owner");
    let other = crate::job("other").with_durable(true);
    let trigger = due_trigger("t1", &job.key, Schedule::once(), 60_000);
    store.store_job_and_trigger(&job, &trigger).await.unwrap();
    store.store_job(&other, false).await.unwrap();

    let foreign = due_trigger("t2", &other.key, Schedule::once(), 60_000);
    let err = store.replace_trigger(&trigger.key, &foreign).await.unwrap_err();
    assert!(matches!(err, SchedulerError::ValidationError(_)));

    let replacement = due_trigger("t3", &job.key, Schedule::once(), 120_000);
    assert!(store.replace_trigger(&trigger.key, &replacement).await.unwrap());
    assert!(!store.check_trigger_exists(&trigger.key).await.unwrap());
    assert!(store.check_trigger_exists(&replacement.key).await.unwrap());
    assert!(store.check_job_exists(&job.key).await.unwrap());
}

#[tokio::test]
async fn test_failed_node_execution_is_recovered_once() {
    let dir = tempfile::tempdir().unwrap();
    let node_a = open_store(&dir, "node-a", true).await;
    node_a.scheduler_started().await.unwrap();

    let job = job("important").with_requests_recovery(true);
    let trigger = due_trigger("t1", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), -10);
    node_a.store_job_and_trigger(&job, &trigger).await.unwrap();
    let acquired = node_a
        .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
        .await
        .unwrap();
    fired_bundle(node_a.triggers_fired(&acquired).await.unwrap());

    // node-a 停止心跳
    sqlx::query("UPDATE scheduler_state SET last_checkin_time = ? WHERE instance_id = 'node-a'")
        .bind((now_millis() - Duration::minutes(5)).timestamp_millis())
        .execute(node_a.database().pool())
        .await
        .unwrap();

    let node_b = open_store(&dir, "node-b", true).await;
    let report = node_b.check_in_and_recover().await.unwrap();
    assert_eq!(report.failed_instances, vec!["node-a".to_string()]);
    assert_eq!(report.recovered_records, 1);
    assert_eq!(report.recovery_triggers_created, 1);

    let recovery_keys = node_b
        .get_trigger_keys(Some(RECOVERING_JOBS_GROUP))
        .await
        .unwrap();
    assert_eq!(recovery_keys.len(), 1);
    let recovery = node_b
        .retrieve_trigger(&recovery_keys[0])
        .await
        .unwrap()
        .unwrap();
    assert_eq!(recovery.job_data[RECOVERY_ORIGINAL_TRIGGER_NAME], "t1");
    assert_eq!(recovery.misfire_instruction, MisfireInstruction::IgnoreMisfirePolicy);

    assert_eq!(
        node_b.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(node_b.get_fired_trigger_records().await.unwrap().is_empty());
    let instances = node_b.get_scheduler_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].instance_id, "node-b");

    // 再次心跳不会重复恢复
    let again = node_b.check_in_and_recover().await.unwrap();
    assert!(again.failed_instances.is_empty());
    assert_eq!(
        node_b
            .get_trigger_keys(Some(RECOVERING_JOBS_GROUP))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn test_restart_recovers_interrupted_state() {
    let dir = tempfile::tempdir().unwrap();
    let job = job("restart").with_requests_recovery(true);
    let trigger = due_trigger("t1", &job.key, Schedule::simple(60_000, REPEAT_INDEFINITELY), -10);
    {
        let store = open_store(&dir, "node-a", false).await;
        store.store_job_and_trigger(&job, &trigger).await.unwrap();
        let acquired = store
            .acquire_next_triggers(now_millis() + Duration::seconds(1), 1, Duration::zero())
            .await
            .unwrap();
        fired_bundle(store.triggers_fired(&acquired).await.unwrap());
        store.database().close().await;
    }

    let store = open_store(&dir, "node-a", false).await;
    store.scheduler_started().await.unwrap();

    assert_eq!(
        store.get_trigger_state(&trigger.key).await.unwrap(),
        Some(TriggerState::Waiting)
    );
    assert!(store.get_fired_trigger_records().await.unwrap().is_empty());
    let recovery = store
        .get_trigger_keys(Some(RECOVERING_JOBS_GROUP))
        .await
        .unwrap();
    assert_eq!(recovery.len(), 1);
}

#[tokio::test]
async fn test_retired_instance_removes_state_record() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(&dir, "node-a", true).await;
    store.scheduler_started().await.unwrap();
    assert_eq!(store.get_scheduler_instances().await.unwrap().len(), 1);

    store.shutdown(true).await.unwrap();
    assert!(store.get_scheduler_instances().await.unwrap().is_empty());
}
