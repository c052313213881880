pub mod listeners;
pub mod pool;
pub mod run_shell;

pub use listeners::ListenerManager;
pub use pool::{RunningJob, WorkerPool};
pub use run_shell::{JobCompletion, JobRunShell};
