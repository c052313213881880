use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::check_interval_ms;

/// 自动生成实例标识时使用的占位值
pub const AUTO_INSTANCE_ID: &str = "AUTO";

/// 调度器（调度循环）配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 调度器名称，同一集群中的实例必须相同
    pub name: String,
    /// 实例标识，集群中必须唯一；`AUTO` 表示按主机名和时间戳生成
    pub instance_id: String,
    /// 没有待触发的触发器时的等待时间
    pub idle_wait_time_ms: u64,
    /// 单次最多获取的触发器数量
    pub batch_trigger_acquisition_max_count: usize,
    /// 允许提前获取的时间窗口
    pub batch_trigger_acquisition_fire_ahead_time_window_ms: u64,
    /// 存储访问失败后的重试间隔
    pub db_failure_retry_interval_ms: u64,
    /// 关闭时是否中断正在执行的作业
    pub interrupt_jobs_on_shutdown: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "ClusteredScheduler".to_string(),
            instance_id: AUTO_INSTANCE_ID.to_string(),
            idle_wait_time_ms: 30_000,
            batch_trigger_acquisition_max_count: 1,
            batch_trigger_acquisition_fire_ahead_time_window_ms: 0,
            db_failure_retry_interval_ms: 15_000,
            interrupt_jobs_on_shutdown: false,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            return Err(anyhow::anyhow!("调度器名称不能为空"));
        }
        if self.instance_id.trim().is_empty() {
            return Err(anyhow::anyhow!("实例标识不能为空"));
        }
        if self.idle_wait_time_ms < 100 {
            return Err(anyhow::anyhow!("空闲等待时间不能小于100毫秒"));
        }
        check_interval_ms("空闲等待时间", self.idle_wait_time_ms)?;
        check_interval_ms(
            "批量获取时间窗口",
            self.batch_trigger_acquisition_fire_ahead_time_window_ms,
        )?;
        check_interval_ms("存储失败重试间隔", self.db_failure_retry_interval_ms)?;
        if self.batch_trigger_acquisition_max_count == 0 {
            return Err(anyhow::anyhow!("批量获取数量必须大于0"));
        }
        if self.db_failure_retry_interval_ms == 0 {
            return Err(anyhow::anyhow!("存储失败重试间隔必须大于0"));
        }
        Ok(())
    }

    /// 解析实际使用的实例标识
    pub fn resolve_instance_id(&self) -> String {
        if self.instance_id != AUTO_INSTANCE_ID {
            return self.instance_id.clone();
        }
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        format!("{host}{}", Utc::now().timestamp_millis())
    }

    pub fn idle_wait_time(&self) -> Duration {
        Duration::from_millis(self.idle_wait_time_ms)
    }

    pub fn fire_ahead_time_window(&self) -> Duration {
        Duration::from_millis(self.batch_trigger_acquisition_fire_ahead_time_window_ms)
    }

    pub fn db_failure_retry_interval(&self) -> Duration {
        Duration::from_millis(self.db_failure_retry_interval_ms)
    }
}
