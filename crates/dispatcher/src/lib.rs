pub mod completion;
pub mod factory;
pub mod health;
pub mod recovery;
pub mod scheduler;
pub mod scheduler_thread;
pub mod signal;

pub use factory::SchedulerFactory;
pub use health::{HealthReporter, SchedulerHealth};
pub use scheduler::{Scheduler, SchedulerComponents, SchedulerMetaData};
pub use scheduler_thread::SchedulerState;
pub use scheduler_worker::{JobCompletion, ListenerManager, RunningJob};
pub use signal::{SchedulerSignalerImpl, SchedulingSignal};
