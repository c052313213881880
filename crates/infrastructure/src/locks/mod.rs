//! 集群锁
//!
//! 两种可互换的实现：在事务内更新锁记录行（可跨进程），以及进程内按名称区分的互斥量。
//! 同一执行路径不能重复获取同名锁；同时持有两把锁时总是先 STATE_ACCESS 后 TRIGGER_ACCESS。

mod database;
mod memory;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tokio::sync::OwnedMutexGuard;

use scheduler_core::config::LockHandlerKind;
use scheduler_errors::SchedulerResult;

pub use database::DatabaseRowLock;
pub use memory::InProcessSemaphore;

/// 触发器获取、触发、完成以及作业/触发器变更
pub const TRIGGER_ACCESS: &str = "TRIGGER_ACCESS";
/// 集群心跳与失联实例恢复
pub const STATE_ACCESS: &str = "STATE_ACCESS";

/// 锁的持有凭证；丢弃时进程内锁随之释放，行锁随事务结束释放
#[derive(Debug)]
pub struct LockToken {
    lock_name: &'static str,
    guard: Option<OwnedMutexGuard<()>>,
}

impl LockToken {
    pub(crate) fn row_lock(lock_name: &'static str) -> Self {
        Self {
            lock_name,
            guard: None,
        }
    }

    pub(crate) fn in_process(lock_name: &'static str, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            lock_name,
            guard: Some(guard),
        }
    }

    pub fn lock_name(&self) -> &'static str {
        self.lock_name
    }

    pub fn is_in_process(&self) -> bool {
        self.guard.is_some()
    }
}

#[async_trait]
pub trait Semaphore: Send + Sync {
    /// 获取命名锁；需要连接的实现必须在调用方的事务内执行
    async fn obtain_lock(
        &self,
        conn: Option<&mut SqliteConnection>,
        lock_name: &'static str,
    ) -> SchedulerResult<LockToken>;

    async fn release_lock(&self, token: LockToken);

    /// 是否需要在事务连接上获取
    fn requires_connection(&self) -> bool;
}

pub fn semaphore_for(
    kind: LockHandlerKind,
    sched_name: &str,
    instance_id: &str,
) -> Box<dyn Semaphore> {
    match kind {
        LockHandlerKind::Database => Box::new(DatabaseRowLock::new(sched_name, instance_id)),
        LockHandlerKind::Semaphore => Box::new(InProcessSemaphore::new()),
    }
}
