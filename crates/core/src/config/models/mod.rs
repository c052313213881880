pub mod app_config;
pub mod job_store;
pub mod observability;
pub mod scheduler;
pub mod thread_pool;

pub use app_config::AppConfig;
pub use job_store::{JobStoreConfig, LockHandlerKind, TransactionMode};
pub use observability::{LogFormat, ObservabilityConfig};
pub use scheduler::{SchedulerConfig, AUTO_INSTANCE_ID};
pub use thread_pool::ThreadPoolConfig;

/// 毫秒类配置项的上限：一年
pub const MAX_INTERVAL_MS: u64 = 365 * 24 * 60 * 60 * 1000;

/// 毫秒配置值换算为 chrono 时长，超出上限时截断到上限
pub fn bounded_millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(ms.min(MAX_INTERVAL_MS) as i64)
}

/// 校验毫秒配置值不超过上限
pub(crate) fn check_interval_ms(name: &str, ms: u64) -> anyhow::Result<()> {
    if ms > MAX_INTERVAL_MS {
        return Err(anyhow::anyhow!("{name}不能超过{MAX_INTERVAL_MS}毫秒"));
    }
    Ok(())
}
