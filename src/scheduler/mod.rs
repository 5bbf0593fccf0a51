mod queue;
mod service;
mod worker;

pub use queue::{Task, TaskQueue, TaskStatus};
pub use service::{DispatchRound, Dispatcher, PostponeReason, SchedulerService};
pub use worker::WorkerPool;
