use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use scheduler_core::{AppConfig, JobRegistry};
use scheduler_dispatcher::SchedulerFactory;
use scheduler_domain::{
    Job, JobDetail, JobExecutionContext, JobExecutionError, JobKey, Schedule, Trigger, TriggerKey,
};

struct PrintJob;

#[async_trait]
impl Job for PrintJob {
    async fn execute(&self, ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
        println!(
            "   执行 {}: 计划 {:?}, 实际 {}",
            ctx.job.key,
            ctx.scheduled_fire_time.map(|t| t.format("%H:%M:%S").to_string()),
            ctx.fire_time.format("%H:%M:%S%.3f")
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== CRON调度器演示 ===\n");

    let dir = tempfile::tempdir()?;
    let mut config = AppConfig::default();
    config.scheduler.idle_wait_time_ms = 1_000;
    config.job_store.url = format!("sqlite://{}", dir.path().join("demo.db").display());

    let registry = JobRegistry::new();
    registry.register("print", Arc::new(PrintJob)).await?;
    let scheduler = SchedulerFactory::new(config)
        .with_job_registry(registry)
        .build()
        .await?;

    println!("1. 即将到来的触发时间 (工作日9点):");
    let weekday_9am = Trigger::new(
        TriggerKey::with_default_group("weekday-9am"),
        JobKey::with_default_group("report"),
        Schedule::cron("0 0 9 * * Mon-Fri")?,
    );
    let mut after = Utc::now();
    for i in 1..=5 {
        let Some(next) = weekday_9am.fire_time_after(after) else {
            break;
        };
        println!("   第{i}次: {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
        after = next;
    }

    println!("\n2. 每秒触发的作业:");
    let job_key = JobKey::with_default_group("tick");
    let trigger = Trigger::new(
        TriggerKey::with_default_group("every-second"),
        job_key.clone(),
        Schedule::cron("* * * * * *")?,
    );
    let first = scheduler
        .schedule_job(JobDetail::new(job_key, "print"), trigger)
        .await?;
    println!("   首次触发: {}", first.format("%H:%M:%S"));

    scheduler.start().await?;
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    scheduler.shutdown(true).await?;

    let metadata = scheduler.metadata().await;
    println!("\n3. 调度器状态:");
    println!("   已执行作业数: {}", metadata.jobs_executed);
    println!("   状态: {:?}", metadata.state);

    println!("\n=== 演示完成 ===");
    Ok(())
}
