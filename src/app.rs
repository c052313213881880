use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tracing::{error, info};

use scheduler_core::{AppConfig, JobRegistry};
use scheduler_dispatcher::{Scheduler, SchedulerFactory};
use scheduler_infrastructure::{DataSourceRegistry, DatabaseManager};

use crate::jobs::register_builtin_jobs;

/// 一个调度节点：数据源、作业注册表和调度器
pub struct Application {
    config: AppConfig,
    data_sources: Arc<DataSourceRegistry>,
    scheduler: Scheduler,
}

impl Application {
    /// 按配置创建节点，注册内置作业类型
    pub async fn new(config: AppConfig) -> Result<Self> {
        Self::with_registry(config, JobRegistry::new()).await
    }

    /// 使用调用方提供的作业注册表（可以预先注册自定义作业类型）
    pub async fn with_registry(config: AppConfig, registry: JobRegistry) -> Result<Self> {
        info!(scheduler = %config.scheduler.name, "初始化调度节点");
        register_builtin_jobs(&registry)
            .await
            .context("注册内置作业类型失败")?;

        let data_sources = Arc::new(DataSourceRegistry::new());
        let scheduler = SchedulerFactory::new(config.clone())
            .with_data_sources(Arc::clone(&data_sources))
            .with_job_registry(registry)
            .build()
            .await
            .context("创建调度器失败")?;

        Ok(Self {
            config,
            data_sources,
            scheduler,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// 启动调度器并运行到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        self.scheduler.start().await.context("启动调度器失败")?;
        info!(
            scheduler = %self.scheduler.name(),
            instance_id = %self.scheduler.instance_id(),
            "调度节点已启动"
        );

        let _ = shutdown_rx.recv().await;
        info!("收到关闭信号，正在停止调度节点");
        self.shutdown().await
    }

    /// 等待正在执行的作业结束后关闭调度器和所有数据源
    pub async fn shutdown(&self) -> Result<()> {
        if let Err(e) = self.scheduler.shutdown(true).await {
            error!("关闭调度器失败: {e}");
        }
        let metadata = self.scheduler.metadata().await;
        info!(jobs_executed = metadata.jobs_executed, "调度器已停止");
        self.data_sources.shutdown().await;
        Ok(())
    }
}

/// 只创建作业存储的表结构
pub async fn init_schema(config: &AppConfig) -> Result<()> {
    let db = DatabaseManager::from_config(&config.job_store)
        .await
        .with_context(|| format!("连接数据库失败: {}", config.job_store.url))?;
    db.initialize_schema().await.context("创建表结构失败")?;
    db.close().await;
    info!(url = %config.job_store.url, "表结构初始化完成");
    Ok(())
}

/// 安装 Prometheus 导出器；必须在创建调度器之前调用，指标句柄在创建时绑定
pub fn init_metrics(config: &AppConfig) -> Result<()> {
    let observability = &config.observability;
    if !observability.metrics_enabled {
        return Ok(());
    }
    let Some(address) = observability.metrics_listen_address.as_deref() else {
        return Ok(());
    };
    let address: std::net::SocketAddr = address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {address}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(address)
        .install()
        .map_err(|e| anyhow::anyhow!("安装Prometheus导出器失败: {e}"))?;
    info!(%address, "Prometheus指标导出已启动");
    Ok(())
}
