use std::path::Path;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigBuilder as Builder, Environment, File, FileFormat};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};

use super::{
    job_store::JobStoreConfig, observability::ObservabilityConfig, scheduler::SchedulerConfig,
    thread_pool::ThreadPoolConfig,
};

/// 未指定配置文件时依次查找的位置
pub const DEFAULT_CONFIG_PATHS: [&str; 3] = [
    "config/scheduler.toml",
    "scheduler.toml",
    "/etc/scheduler/config.toml",
];

/// 环境变量前缀，节之间用 `__` 分隔，例如 `SCHEDULER_JOB_STORE__CLUSTERED=true`
pub const ENV_PREFIX: &str = "SCHEDULER";

/// 调度节点的完整配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub thread_pool: ThreadPoolConfig,
    pub job_store: JobStoreConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 默认值 → TOML 文件 → 环境变量，后者覆盖前者
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let config: AppConfig = Self::sources(config_path)?
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    fn sources(config_path: Option<&str>) -> Result<Builder<DefaultState>> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("加载默认配置失败")?;
        let builder = ConfigBuilder::builder().add_source(defaults);

        let file = match config_path {
            Some(path) if Path::new(path).exists() => Some(path),
            Some(path) => return Err(anyhow::anyhow!("配置文件不存在: {path}")),
            None => DEFAULT_CONFIG_PATHS
                .iter()
                .copied()
                .find(|p| Path::new(p).exists()),
        };
        Ok(match file {
            Some(path) => builder.add_source(File::new(path, FileFormat::Toml)),
            None => builder,
        })
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// 逐节校验，再检查跨节约束
    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.thread_pool.validate().context("线程池配置验证失败")?;
        self.job_store.validate().context("作业存储配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        // 内存数据库只对单个连接池可见，无法被其他节点共享
        if self.job_store.clustered && is_in_memory_url(&self.job_store.url) {
            return Err(anyhow::anyhow!("集群模式需要基于文件的SQLite数据库"));
        }
        if self.scheduler.batch_trigger_acquisition_max_count > self.thread_pool.thread_count {
            tracing::warn!(
                batch = self.scheduler.batch_trigger_acquisition_max_count,
                threads = self.thread_pool.thread_count,
                "批量获取数量大于线程数，实际批量受空闲线程数限制"
            );
        }
        Ok(())
    }
}

fn is_in_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}
