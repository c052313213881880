use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use scheduler_errors::{SchedulerError, SchedulerResult};

use super::{LockToken, Semaphore};

/// 进程内的命名互斥量，只能保证同一进程内的互斥
#[derive(Debug, Default)]
pub struct InProcessSemaphore {
    locks: Mutex<HashMap<&'static str, Arc<AsyncMutex<()>>>>,
}

impl InProcessSemaphore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex_for(&self, lock_name: &'static str) -> SchedulerResult<Arc<AsyncMutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| SchedulerError::Internal("锁表已损坏".to_string()))?;
        Ok(locks
            .entry(lock_name)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone())
    }
}

#[async_trait]
impl Semaphore for InProcessSemaphore {
    async fn obtain_lock(
        &self,
        _conn: Option<&mut SqliteConnection>,
        lock_name: &'static str,
    ) -> SchedulerResult<LockToken> {
        let mutex = self.mutex_for(lock_name)?;
        let guard = mutex.lock_owned().await;
        debug!(lock = lock_name, "已获取进程内锁");
        Ok(LockToken::in_process(lock_name, guard))
    }

    async fn release_lock(&self, token: LockToken) {
        debug!(lock = token.lock_name(), "释放进程内锁");
        drop(token);
    }

    fn requires_connection(&self) -> bool {
        false
    }
}
