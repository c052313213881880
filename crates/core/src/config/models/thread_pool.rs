use serde::{Deserialize, Serialize};

/// 作业执行线程池配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadPoolConfig {
    /// 同时执行的作业上限
    pub thread_count: usize,
    /// 单次执行超时，0 表示不限制
    pub job_timeout_ms: u64,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            thread_count: 10,
            job_timeout_ms: 0,
        }
    }
}

impl ThreadPoolConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.thread_count == 0 {
            return Err(anyhow::anyhow!("线程数必须大于0"));
        }
        Ok(())
    }

    pub fn job_timeout(&self) -> Option<std::time::Duration> {
        (self.job_timeout_ms > 0).then(|| std::time::Duration::from_millis(self.job_timeout_ms))
    }
}
