use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use scheduler_domain::Job;
use scheduler_errors::{SchedulerError, SchedulerResult};

/// 作业类型名称到可执行逻辑的映射
///
/// 作业定义只保存类型名称，执行时由执行外壳在这里查找实现。
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: Arc<RwLock<HashMap<String, Arc<dyn Job>>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册作业实现，已存在时返回错误
    pub async fn register(&self, job_type: impl Into<String>, job: Arc<dyn Job>) -> SchedulerResult<()> {
        let job_type = job_type.into();
        let mut registry = self.jobs.write().await;
        if registry.contains_key(&job_type) {
            return Err(SchedulerError::already_exists("job_type", job_type));
        }
        registry.insert(job_type, job);
        Ok(())
    }

    pub async fn register_batch(&self, jobs: Vec<(String, Arc<dyn Job>)>) -> SchedulerResult<()> {
        for (job_type, job) in jobs {
            self.register(job_type, job).await?;
        }
        Ok(())
    }

    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn Job>> {
        let registry = self.jobs.read().await;
        registry.get(job_type).cloned()
    }

    pub async fn contains(&self, job_type: &str) -> bool {
        let registry = self.jobs.read().await;
        registry.contains_key(job_type)
    }

    pub async fn unregister(&self, job_type: &str) -> bool {
        let mut registry = self.jobs.write().await;
        registry.remove(job_type).is_some()
    }

    pub async fn list_job_types(&self) -> Vec<String> {
        let registry = self.jobs.read().await;
        let mut names: Vec<String> = registry.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn count(&self) -> usize {
        let registry = self.jobs.read().await;
        registry.len()
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use scheduler_domain::{JobExecutionContext, JobExecutionError};

    struct NoopJob;

    #[async_trait]
    impl Job for NoopJob {
        async fn execute(&self, _ctx: &mut JobExecutionContext) -> Result<(), JobExecutionError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        registry.register("noop", Arc::new(NoopJob)).await.unwrap();
        assert!(registry.contains("noop").await);
        assert!(registry.get("noop").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let registry = JobRegistry::new();
        registry.register("noop", Arc::new(NoopJob)).await.unwrap();
        let err = registry.register("noop", Arc::new(NoopJob)).await.unwrap_err();
        assert!(matches!(err, SchedulerError::ObjectAlreadyExists { .. }));
        assert!(registry.unregister("noop").await);
        assert!(registry.list_job_types().await.is_empty());
    }
}
