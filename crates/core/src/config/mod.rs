//! 配置管理
//!
//! 配置按调度器、线程池、作业存储和可观测性分节，从TOML文件加载，
//! 再由 `SCHEDULER_` 前缀的环境变量覆盖。

pub mod models;

#[cfg(test)]
mod tests;

pub use models::*;
