use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 未指定分组时使用的默认分组
pub const DEFAULT_GROUP: &str = "DEFAULT";
/// 集群恢复时生成的一次性恢复触发器所在分组
pub const RECOVERING_JOBS_GROUP: &str = "RECOVERING_JOBS";
/// 手动触发（trigger_job）生成的一次性触发器所在分组
pub const MANUAL_TRIGGER_GROUP: &str = "MANUAL_TRIGGER";

/// 作业/触发器数据映射
pub type JobDataMap = serde_json::Map<String, serde_json::Value>;

/// 作业标识：名称 + 分组，二者共同构成唯一键
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub name: String,
    pub group: String,
}

impl JobKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// 触发器标识：名称 + 分组
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriggerKey {
    pub name: String,
    pub group: String,
}

impl TriggerKey {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }

    pub fn with_default_group(name: impl Into<String>) -> Self {
        Self::new(name, DEFAULT_GROUP)
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.name)
    }
}

/// 毫秒精度的当前时间。持久层以毫秒存储时间戳，统一精度后读写前后的值可以直接比较。
pub fn now_millis() -> DateTime<Utc> {
    truncate_to_millis(Utc::now())
}

pub fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(time.timestamp_millis()).unwrap_or(time)
}

pub fn millis(ms: i64) -> Duration {
    Duration::milliseconds(ms)
}
