use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),
    #[error("持久化失败: {0}")]
    Persistence(String),
    #[error("对象已存在: {kind} {key}")]
    ObjectAlreadyExists { kind: &'static str, key: String },
    #[error("作业未找到: {key}")]
    JobNotFound { key: String },
    #[error("触发器未找到: {key}")]
    TriggerNotFound { key: String },
    #[error("日历未找到: {name}")]
    CalendarNotFound { name: String },
    #[error("集群锁不可用: {lock_name}")]
    ClusterLockUnavailable { lock_name: String },
    #[error("作业执行错误: {0}")]
    JobExecution(String),
    #[error("无效的调度规则: {0}")]
    InvalidSchedule(String),
    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },
    #[error("调度器已关闭")]
    SchedulerShutdown,
    #[error("序列化错误: {0}")]
    Serialization(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("数据验证失败: {0}")]
    ValidationError(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("内部错误: {0}")]
    Internal(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        Self::Persistence(msg.into())
    }
    pub fn already_exists<S: Into<String>>(kind: &'static str, key: S) -> Self {
        Self::ObjectAlreadyExists {
            kind,
            key: key.into(),
        }
    }
    pub fn job_not_found<S: Into<String>>(key: S) -> Self {
        Self::JobNotFound { key: key.into() }
    }
    pub fn trigger_not_found<S: Into<String>>(key: S) -> Self {
        Self::TriggerNotFound { key: key.into() }
    }
    pub fn calendar_not_found<S: Into<String>>(name: S) -> Self {
        Self::CalendarNotFound { name: name.into() }
    }
    pub fn lock_unavailable<S: Into<String>>(lock_name: S) -> Self {
        Self::ClusterLockUnavailable {
            lock_name: lock_name.into(),
        }
    }
    pub fn invalid_schedule<S: Into<String>>(msg: S) -> Self {
        Self::InvalidSchedule(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn validation_error<S: Into<String>>(msg: S) -> Self {
        Self::ValidationError(msg.into())
    }
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Internal(_)
                | SchedulerError::Configuration(_)
                | SchedulerError::SchedulerShutdown
        )
    }
    /// 瞬时性故障：持久层抖动、锁竞争、SQLite 的 busy/locked。
    /// 调用方整体重试受保护的操作，而不是重试其中一部分。
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::Persistence(_)
            | SchedulerError::ClusterLockUnavailable { .. }
            | SchedulerError::Timeout(_) => true,
            SchedulerError::Database(e) => is_transient_sqlx_error(e),
            _ => false,
        }
    }
    pub fn user_message(&self) -> &str {
        match self {
            SchedulerError::JobNotFound { .. } => "请求的作业不存在",
            SchedulerError::TriggerNotFound { .. } => "请求的触发器不存在",
            SchedulerError::CalendarNotFound { .. } => "请求的日历不存在",
            SchedulerError::ObjectAlreadyExists { .. } => "对象已存在",
            SchedulerError::InvalidSchedule(_) | SchedulerError::InvalidCron { .. } => {
                "调度规则配置有误"
            }
            SchedulerError::ValidationError(_) => "输入数据验证失败",
            SchedulerError::SchedulerShutdown => "调度器已关闭",
            SchedulerError::Timeout(_) => "操作超时，请稍后重试",
            _ => "系统繁忙，请稍后重试",
        }
    }
}

fn is_transient_sqlx_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            // SQLITE_BUSY(5) / SQLITE_LOCKED(6)
            matches!(db.code().as_deref(), Some("5") | Some("6") | Some("517"))
                || db.message().contains("database is locked")
        }
        _ => false,
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
