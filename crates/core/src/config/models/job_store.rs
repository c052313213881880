use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{check_interval_ms, MAX_INTERVAL_MS};

/// 集群锁实现
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockHandlerKind {
    /// 在事务内更新锁记录行，可跨进程互斥
    Database,
    /// 进程内的命名互斥量，仅适用于非集群部署
    Semaphore,
}

/// 事务边界的管理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionMode {
    /// 每个操作自行开始、提交或回滚事务
    SelfManaged,
    /// 由外部调用方管理事务，存储只使用普通连接
    CallerManaged,
}

/// 作业存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobStoreConfig {
    /// 数据源名称，在 DataSourceRegistry 中查找
    pub data_source: String,
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_seconds: u64,
    pub clustered: bool,
    pub cluster_checkin_interval_ms: u64,
    /// 超过该时长未触发即视为错过触发
    pub misfire_threshold_ms: u64,
    pub max_misfires_to_handle_at_a_time: usize,
    pub lock_handler: LockHandlerKind,
    pub transaction_mode: TransactionMode,
    /// 瞬时存储错误的重试次数
    pub retry_attempts: u32,
    pub retry_interval_ms: u64,
    /// 获取触发器时是否持有集群锁
    pub acquire_triggers_within_lock: bool,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            data_source: "default".to_string(),
            url: "sqlite://scheduler.db".to_string(),
            max_connections: 10,
            connection_timeout_seconds: 30,
            clustered: false,
            cluster_checkin_interval_ms: 7_500,
            misfire_threshold_ms: 60_000,
            max_misfires_to_handle_at_a_time: 20,
            lock_handler: LockHandlerKind::Database,
            transaction_mode: TransactionMode::SelfManaged,
            retry_attempts: 3,
            retry_interval_ms: 1_000,
            acquire_triggers_within_lock: true,
        }
    }
}

impl JobStoreConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.data_source.trim().is_empty() {
            return Err(anyhow::anyhow!("数据源名称不能为空"));
        }
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if !self.url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!("数据库URL必须是SQLite格式"));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("最大连接数必须大于0"));
        }
        if self.misfire_threshold_ms == 0 {
            return Err(anyhow::anyhow!("补火阈值必须大于0"));
        }
        check_interval_ms("补火阈值", self.misfire_threshold_ms)?;
        check_interval_ms("集群心跳间隔", self.cluster_checkin_interval_ms)?;
        check_interval_ms("重试间隔", self.retry_interval_ms)?;
        if self.connection_timeout_seconds > MAX_INTERVAL_MS / 1_000 {
            return Err(anyhow::anyhow!("连接超时过长: {}秒", self.connection_timeout_seconds));
        }
        if self.max_misfires_to_handle_at_a_time == 0 {
            return Err(anyhow::anyhow!("单次处理的错过触发数量必须大于0"));
        }
        if self.clustered {
            if self.cluster_checkin_interval_ms == 0 {
                return Err(anyhow::anyhow!("集群心跳间隔必须大于0"));
            }
            if self.lock_handler == LockHandlerKind::Semaphore {
                return Err(anyhow::anyhow!("集群模式下不能使用进程内信号量锁"));
            }
        }
        Ok(())
    }

    pub fn misfire_threshold(&self) -> Duration {
        Duration::from_millis(self.misfire_threshold_ms)
    }

    pub fn cluster_checkin_interval(&self) -> Duration {
        Duration::from_millis(self.cluster_checkin_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}
