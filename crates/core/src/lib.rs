pub mod config;
pub mod job_registry;
pub mod logging;
pub mod metrics;

pub use config::*;
pub use job_registry::JobRegistry;
pub use logging::init_logging;
pub use metrics::SchedulerMetrics;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
