pub mod calendar;
pub mod entities;
pub mod instruction;
pub mod job;
pub mod listeners;
pub mod misfire;
pub mod repositories;
pub mod schedule;
pub mod trigger;
pub mod value_objects;

pub use calendar::*;
pub use entities::*;
pub use instruction::*;
pub use job::*;
pub use listeners::*;
pub use misfire::*;
pub use repositories::*;
pub use schedule::*;
pub use scheduler_errors::{SchedulerError, SchedulerResult};
pub use trigger::*;
pub use value_objects::*;
