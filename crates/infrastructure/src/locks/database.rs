use std::time::Duration;

use async_trait::async_trait;
use sqlx::SqliteConnection;
use tracing::{debug, warn};

use scheduler_domain::now_millis;
use scheduler_errors::{SchedulerError, SchedulerResult};

use super::{LockToken, Semaphore};

const DEFAULT_RETRY_COUNT: u32 = 3;
const DEFAULT_RETRY_PERIOD: Duration = Duration::from_millis(1_000);

/// 悲观行锁：在调用方事务中更新锁记录行
///
/// 更新是事务里的第一条写语句，SQLite 会在此取得写锁并一直持有到事务结束，
/// 其他节点的同名（以及其他）加锁语句会在 busy_timeout 内等待。
#[derive(Debug, Clone)]
pub struct DatabaseRowLock {
    sched_name: String,
    instance_id: String,
    retry_count: u32,
    retry_period: Duration,
}

impl DatabaseRowLock {
    pub fn new(sched_name: &str, instance_id: &str) -> Self {
        Self {
            sched_name: sched_name.to_string(),
            instance_id: instance_id.to_string(),
            retry_count: DEFAULT_RETRY_COUNT,
            retry_period: DEFAULT_RETRY_PERIOD,
        }
    }

    pub fn with_retry(mut self, retry_count: u32, retry_period: Duration) -> Self {
        self.retry_count = retry_count.max(1);
        self.retry_period = retry_period;
        self
    }

    async fn try_mark(&self, conn: &mut SqliteConnection, lock_name: &str) -> SchedulerResult<()> {
        let now = now_millis().timestamp_millis();
        let updated = sqlx::query(
            "UPDATE scheduler_locks SET lock_owner = ?, acquired_at = ? WHERE sched_name = ? AND lock_name = ?",
        )
        .bind(&self.instance_id)
        .bind(now)
        .bind(&self.sched_name)
        .bind(lock_name)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if updated == 0 {
            // 锁记录不存在时先插入，再由同一事务持有
            sqlx::query(
                "INSERT OR IGNORE INTO scheduler_locks (sched_name, lock_name, lock_owner, acquired_at) VALUES (?, ?, ?, ?)",
            )
            .bind(&self.sched_name)
            .bind(lock_name)
            .bind(&self.instance_id)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Semaphore for DatabaseRowLock {
    async fn obtain_lock(
        &self,
        conn: Option<&mut SqliteConnection>,
        lock_name: &'static str,
    ) -> SchedulerResult<LockToken> {
        let conn = conn.ok_or_else(|| {
            SchedulerError::Internal(format!("获取行锁 {lock_name} 需要事务连接"))
        })?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_mark(conn, lock_name).await {
                Ok(()) => {
                    debug!(lock = lock_name, instance_id = %self.instance_id, "已获取行锁");
                    return Ok(LockToken::row_lock(lock_name));
                }
                Err(e) if e.is_retryable() && attempt < self.retry_count => {
                    warn!(
                        lock = lock_name,
                        attempt,
                        error = %e,
                        "获取行锁失败，稍后重试"
                    );
                    tokio::time::sleep(self.retry_period).await;
                }
                Err(e) if e.is_retryable() => {
                    warn!(lock = lock_name, error = %e, "多次尝试后仍无法获取行锁");
                    return Err(SchedulerError::lock_unavailable(lock_name));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_lock(&self, token: LockToken) {
        // 行锁随事务提交或回滚释放
        debug!(lock = token.lock_name(), "释放行锁");
    }

    fn requires_connection(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use sqlx::Row;

    #[tokio::test]
    async fn test_row_lock_records_owner() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("locks.db").display());
        let db = DatabaseManager::new(&url, 2, Duration::from_secs(5)).await.unwrap();
        db.initialize_schema().await.unwrap();

        let lock = DatabaseRowLock::new("sched", "node-a");
        let mut tx = db.pool().begin().await.unwrap();
        let token = lock.obtain_lock(Some(&mut *tx), "TRIGGER_ACCESS").await.unwrap();
        assert!(!token.is_in_process());
        tx.commit().await.unwrap();
        lock.release_lock(token).await;

        let row = sqlx::query("SELECT lock_owner FROM scheduler_locks WHERE sched_name = 'sched' AND lock_name = 'TRIGGER_ACCESS'")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(row.get::<String, _>("lock_owner"), "node-a");
    }

    #[tokio::test]
    async fn test_row_lock_requires_connection() {
        let lock = DatabaseRowLock::new("sched", "node-a");
        assert!(lock.requires_connection());
        assert!(lock.obtain_lock(None, "TRIGGER_ACCESS").await.is_err());
    }

    #[tokio::test]
    async fn test_contended_row_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("contended.db").display());
        let db = DatabaseManager::new(&url, 2, Duration::from_millis(100))
            .await
            .unwrap();
        db.initialize_schema().await.unwrap();

        let holder = DatabaseRowLock::new("sched", "node-a");
        let mut held = db.pool().begin().await.unwrap();
        let _token = holder
            .obtain_lock(Some(&mut *held), "TRIGGER_ACCESS")
            .await
            .unwrap();

        let contender =
            DatabaseRowLock::new("sched", "node-b").with_retry(2, Duration::from_millis(10));
        let mut other = db.pool().begin().await.unwrap();
        let err = contender
            .obtain_lock(Some(&mut *other), "TRIGGER_ACCESS")
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::ClusterLockUnavailable { .. }));
        held.rollback().await.unwrap();
    }
}
