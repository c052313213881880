pub mod app;
pub mod jobs;
pub mod shutdown;

pub use app::{init_metrics, init_schema, Application};
pub use jobs::{register_builtin_jobs, LogJob, LOG_JOB_TYPE};
pub use shutdown::{wait_for_shutdown_signal, ShutdownManager};
