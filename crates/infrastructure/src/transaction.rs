//! 事务边界策略
//!
//! 存储只依赖 `TransactionBoundary` 取得连接并结束它，是否真正开启事务由注入的策略决定。

use std::ops::{Deref, DerefMut};

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::warn;

use scheduler_core::config::TransactionMode;
use scheduler_errors::SchedulerResult;

/// 一次存储操作使用的连接
pub enum StoreConnection {
    /// 由存储自己开启的事务，丢弃时自动回滚
    Transaction(Transaction<'static, Sqlite>),
    /// 普通连接，事务由调用方负责
    Pooled(PoolConnection<Sqlite>),
}

impl Deref for StoreConnection {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        match self {
            StoreConnection::Transaction(tx) => &**tx,
            StoreConnection::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for StoreConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            StoreConnection::Transaction(tx) => &mut **tx,
            StoreConnection::Pooled(conn) => &mut **conn,
        }
    }
}

impl StoreConnection {
    pub fn is_transactional(&self) -> bool {
        matches!(self, StoreConnection::Transaction(_))
    }
}

#[async_trait]
pub trait TransactionBoundary: Send + Sync {
    fn name(&self) -> &'static str;

    async fn begin(&self, pool: &SqlitePool) -> SchedulerResult<StoreConnection>;

    async fn commit(&self, conn: StoreConnection) -> SchedulerResult<()>;

    async fn rollback(&self, conn: StoreConnection);
}

/// 每个操作自行 begin/commit/rollback
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfManagedTransactions;

#[async_trait]
impl TransactionBoundary for SelfManagedTransactions {
    fn name(&self) -> &'static str {
        "self_managed"
    }

    async fn begin(&self, pool: &SqlitePool) -> SchedulerResult<StoreConnection> {
        Ok(StoreConnection::Transaction(pool.begin().await?))
    }

    async fn commit(&self, conn: StoreConnection) -> SchedulerResult<()> {
        if let StoreConnection::Transaction(tx) = conn {
            tx.commit().await?;
        }
        Ok(())
    }

    async fn rollback(&self, conn: StoreConnection) {
        if let StoreConnection::Transaction(tx) = conn {
            if let Err(e) = tx.rollback().await {
                warn!(error = %e, "事务回滚失败");
            }
        }
    }
}

/// 假定调用方管理事务：只借出普通连接，提交与回滚都不做任何事
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerManagedTransactions;

#[async_trait]
impl TransactionBoundary for CallerManagedTransactions {
    fn name(&self) -> &'static str {
        "caller_managed"
    }

    async fn begin(&self, pool: &SqlitePool) -> SchedulerResult<StoreConnection> {
        Ok(StoreConnection::Pooled(pool.acquire().await?))
    }

    async fn commit(&self, _conn: StoreConnection) -> SchedulerResult<()> {
        Ok(())
    }

    async fn rollback(&self, _conn: StoreConnection) {}
}

pub fn transaction_boundary_for(mode: TransactionMode) -> Box<dyn TransactionBoundary> {
    match mode {
        TransactionMode::SelfManaged => Box::new(SelfManagedTransactions),
        TransactionMode::CallerManaged => Box::new(CallerManagedTransactions),
    }
}
