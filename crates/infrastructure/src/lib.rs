//! 调度器的持久化层：SQLite 连接管理、集群锁、事务边界以及作业存储实现

pub mod data_source;
pub mod database;
pub mod job_store;
pub mod locks;
pub mod retry;
pub mod transaction;

pub use data_source::DataSourceRegistry;
pub use database::DatabaseManager;
pub use job_store::{JobStoreOptions, SqlJobStore, StoreDelegate, ALL_GROUPS_PAUSED};
pub use locks::{
    semaphore_for, DatabaseRowLock, InProcessSemaphore, LockToken, Semaphore, STATE_ACCESS,
    TRIGGER_ACCESS,
};
pub use retry::RetryPolicy;
pub use transaction::{
    transaction_boundary_for, CallerManagedTransactions, SelfManagedTransactions,
    StoreConnection, TransactionBoundary,
};
