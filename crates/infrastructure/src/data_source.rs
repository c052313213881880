use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use scheduler_core::config::JobStoreConfig;
use scheduler_errors::{SchedulerError, SchedulerResult};

use crate::database::DatabaseManager;

/// 显式构造、显式拥有的数据源注册表
///
/// 组件通过参数拿到注册表再按名称取连接池，关闭时统一释放所有连接池。
#[derive(Debug, Default)]
pub struct DataSourceRegistry {
    sources: RwLock<HashMap<String, DatabaseManager>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: impl Into<String>, manager: DatabaseManager) -> SchedulerResult<()> {
        let name = name.into();
        let mut sources = self.sources.write().await;
        if sources.contains_key(&name) {
            return Err(SchedulerError::already_exists("data_source", name));
        }
        sources.insert(name, manager);
        Ok(())
    }

    /// 取得已注册的数据源，不存在时按配置创建并注册
    pub async fn get_or_connect(&self, config: &JobStoreConfig) -> SchedulerResult<DatabaseManager> {
        if let Some(existing) = self.get(&config.data_source).await {
            return Ok(existing);
        }
        let mut sources = self.sources.write().await;
        if let Some(existing) = sources.get(&config.data_source) {
            return Ok(existing.clone());
        }
        let manager = DatabaseManager::from_config(config).await?;
        info!(data_source = %config.data_source, url = %config.url, "已创建数据源");
        sources.insert(config.data_source.clone(), manager.clone());
        Ok(manager)
    }

    pub async fn get(&self, name: &str) -> Option<DatabaseManager> {
        let sources = self.sources.read().await;
        sources.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let sources = self.sources.read().await;
        sources.keys().cloned().collect()
    }

    /// 关闭并移除所有数据源
    pub async fn shutdown(&self) {
        let drained: Vec<(String, DatabaseManager)> = {
            let mut sources = self.sources.write().await;
            sources.drain().collect()
        };
        for (name, manager) in drained {
            manager.close().await;
            info!(data_source = %name, "数据源已关闭");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config(name: &str) -> JobStoreConfig {
        JobStoreConfig {
            data_source: name.to_string(),
            url: "sqlite::memory:".to_string(),
            ..JobStoreConfig::default()
        }
    }

    #[tokio::test]
    async fn test_get_or_connect_reuses_pool() {
        let registry = DataSourceRegistry::new();
        let first = registry.get_or_connect(&memory_config("main")).await.unwrap();
        let second = registry.get_or_connect(&memory_config("main")).await.unwrap();
        assert_eq!(first.url(), second.url());
        assert_eq!(registry.names().await, vec!["main".to_string()]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_all() {
        let registry = DataSourceRegistry::new();
        let manager = registry.get_or_connect(&memory_config("main")).await.unwrap();
        registry.shutdown().await;
        assert!(manager.is_closed());
        assert!(registry.get("main").await.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = DataSourceRegistry::new();
        let manager = DatabaseManager::from_config(&memory_config("a")).await.unwrap();
        registry.register("a", manager.clone()).await.unwrap();
        assert!(registry.register("a", manager).await.is_err());
    }
}
