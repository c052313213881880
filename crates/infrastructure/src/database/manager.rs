use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;
use tracing::{debug, info};

use scheduler_core::config::JobStoreConfig;
use scheduler_errors::{SchedulerError, SchedulerResult};

use super::schema;

/// SQLite 连接池管理
///
/// 内存数据库的每个连接都是独立的库，所以强制只用一个连接并且不回收空闲连接。
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
    url: String,
}

impl DatabaseManager {
    pub async fn new(
        url: &str,
        max_connections: u32,
        connection_timeout: Duration,
    ) -> SchedulerResult<Self> {
        let in_memory = Self::is_in_memory(url);
        let mut connect_options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .busy_timeout(connection_timeout);
        if !in_memory {
            connect_options = connect_options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(connection_timeout)
            .max_connections(if in_memory { 1 } else { max_connections });
        if in_memory {
            pool_options = pool_options
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(connect_options)
            .await
            .map_err(SchedulerError::Database)?;

        debug!(url = %url, in_memory, "SQLite连接池已创建");
        Ok(Self {
            pool,
            url: url.to_string(),
        })
    }

    pub async fn from_config(config: &JobStoreConfig) -> SchedulerResult<Self> {
        Self::new(
            &config.url,
            config.max_connections,
            Duration::from_secs(config.connection_timeout_seconds),
        )
        .await
    }

    fn is_in_memory(url: &str) -> bool {
        url.contains(":memory:") || url.contains("mode=memory")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 创建作业存储所需的表
    pub async fn initialize_schema(&self) -> SchedulerResult<()> {
        schema::run_migrations(&self.pool).await?;
        info!(url = %self.url, "作业存储表结构已就绪");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
