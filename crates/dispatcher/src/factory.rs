use std::sync::Arc;

use tracing::info;

use scheduler_core::{AppConfig, JobRegistry, SchedulerMetrics};
use scheduler_errors::{SchedulerError, SchedulerResult};
use scheduler_infrastructure::{DataSourceRegistry, JobStoreOptions, SqlJobStore};

use crate::scheduler::{Scheduler, SchedulerComponents};

/// 按配置组装调度器：数据源 → 作业存储 → 调度器
pub struct SchedulerFactory {
    config: AppConfig,
    data_sources: Arc<DataSourceRegistry>,
    registry: JobRegistry,
    metrics: SchedulerMetrics,
}

impl SchedulerFactory {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            data_sources: Arc::new(DataSourceRegistry::new()),
            registry: JobRegistry::new(),
            metrics: SchedulerMetrics::new(),
        }
    }

    /// 使用外部拥有的数据源注册表，多个调度器可以共享同一个连接池
    pub fn with_data_sources(mut self, data_sources: Arc<DataSourceRegistry>) -> Self {
        self.data_sources = data_sources;
        self
    }

    pub fn with_job_registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_metrics(mut self, metrics: SchedulerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn data_sources(&self) -> Arc<DataSourceRegistry> {
        Arc::clone(&self.data_sources)
    }

    pub fn job_registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub async fn build(&self) -> SchedulerResult<Scheduler> {
        self.config
            .validate()
            .map_err(|e| SchedulerError::config_error(format!("{e:#}")))?;

        let instance_id = self.config.scheduler.resolve_instance_id();
        let db = self.data_sources.get_or_connect(&self.config.job_store).await?;
        let options = JobStoreOptions::from_config(
            &self.config.scheduler.name,
            &instance_id,
            &self.config.job_store,
        );
        let store = SqlJobStore::new(db, options).with_metrics(self.metrics.clone());

        info!(
            scheduler = %self.config.scheduler.name,
            instance_id = %instance_id,
            data_source = %self.config.job_store.data_source,
            "正在创建调度器"
        );

        Scheduler::new(SchedulerComponents {
            config: self.config.clone(),
            instance_id,
            store: Arc::new(store),
            store_name: "SqlJobStore".to_string(),
            registry: self.registry.clone(),
            metrics: self.metrics.clone(),
        })
        .await
    }
}

impl std::fmt::Debug for SchedulerFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerFactory")
            .field("scheduler", &self.config.scheduler.name)
            .field("data_source", &self.config.job_store.data_source)
            .finish()
    }
}
