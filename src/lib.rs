//! Multi-project orchestration core.
//!
//! Each project owns a hierarchical [`Engine`]. The [`Orchestrator`] turns
//! queued events into at most one committed transition per project per tick,
//! gated by the [`CostMonitor`] and watched by the [`DeadlockDetector`]. The
//! [`SchedulerService`] drains the task queue independently and hands work to
//! agents whose results come back as events.

pub mod agent;
pub mod arbiter;
pub mod config;
pub mod cost;
pub mod deadlock;
pub mod error;
pub mod event;
pub mod memory;
pub mod orchestrator;
pub mod pipeline;
pub mod repository;
pub mod scheduler;
pub mod state_machine;
pub mod telemetry;

pub use agent::{Agent, AgentOutput, PayloadAgent};
pub use arbiter::TransitionArbiter;
pub use config::OrchestratorConfig;
pub use cost::{Budget, CostMonitor, CostReport};
pub use deadlock::DeadlockDetector;
pub use error::{FailureKind, OrchestratorError, Result};
pub use event::Event;
pub use memory::{Embedder, HashingEmbedder, MemoryManager};
pub use orchestrator::{Orchestrator, ProjectStatus, ProjectView, TickOutcome, TickReport};
pub use repository::{CommittedTransition, InMemoryRepository, Repository};
pub use scheduler::{SchedulerService, Task, TaskQueue, WorkerPool};
pub use state_machine::{Engine, StateBehavior, TickContext, Transition, TransitionProposal};
pub use telemetry::{MemorySink, TelemetrySink, TracingSink};
