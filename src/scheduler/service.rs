use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::queue::{Task, TaskQueue};
use crate::config::OrchestratorConfig;
use crate::cost::CostMonitor;
use crate::error::Result;
use crate::telemetry::{DispatchDecision, TelemetryRecord, TelemetrySink, TracingSink};

/// Hands an admitted task to the execution collaborator.
///
/// Must return promptly: the result of the work arrives later as an
/// orchestrator event, never as the return value of this call.
pub trait Dispatcher: Send + Sync {
    fn dispatch(&self, task: Task) -> Result<()>;

    /// Tokens the task is expected to spend, used by both admission gates.
    fn estimate(&self, task: &Task) -> u64 {
        task.est_tokens
    }
}

/// Why a task was held back in a dispatch round.
#[derive(Debug, Clone, PartialEq)]
pub enum PostponeReason {
    /// Projected weekly usage would pass the backpressure threshold.
    Backpressure { projected: u64, threshold: f64 },
    /// The cost monitor reported that the token budget would be exceeded.
    BudgetExceeded { est_tokens: u64 },
}

impl fmt::Display for PostponeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostponeReason::Backpressure {
                projected,
                threshold,
            } => write!(f, "backpressure: projected {projected} tokens > {threshold:.0}"),
            PostponeReason::BudgetExceeded { est_tokens } => {
                write!(f, "budget exceeded: {est_tokens} more tokens would pass the budget")
            }
        }
    }
}

/// Outcome of one [`SchedulerService::run`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchRound {
    pub dispatched: Vec<String>,
    pub postponed: Vec<(String, PostponeReason)>,
    pub failed: Vec<(String, String)>,
}

impl DispatchRound {
    pub fn is_empty(&self) -> bool {
        self.dispatched.is_empty() && self.postponed.is_empty() && self.failed.is_empty()
    }
}

/// Drains the task queue one round at a time under fairness, backpressure
/// and budget rules.
pub struct SchedulerService {
    queue: Arc<Mutex<TaskQueue>>,
    cost_monitor: Arc<RwLock<CostMonitor>>,
    dispatcher: Arc<dyn Dispatcher>,
    telemetry: Arc<dyn TelemetrySink>,
    default_weekly_cap: u64,
    backpressure_ratio: f64,
    weekly_caps: HashMap<String, u64>,
    weekly_usage: HashMap<String, u64>,
}

impl SchedulerService {
    pub fn new(
        config: &OrchestratorConfig,
        queue: Arc<Mutex<TaskQueue>>,
        cost_monitor: Arc<RwLock<CostMonitor>>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        Self {
            queue,
            cost_monitor,
            dispatcher,
            telemetry: Arc::new(TracingSink),
            default_weekly_cap: config.weekly_token_cap,
            backpressure_ratio: config.backpressure_ratio,
            weekly_caps: HashMap::new(),
            weekly_usage: HashMap::new(),
        }
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn queue(&self) -> Arc<Mutex<TaskQueue>> {
        self.queue.clone()
    }

    pub fn set_weekly_cap(&mut self, project_id: &str, cap: u64) {
        self.weekly_caps.insert(project_id.to_string(), cap);
    }

    pub fn weekly_cap(&self, project_id: &str) -> u64 {
        self.weekly_caps
            .get(project_id)
            .copied()
            .unwrap_or(self.default_weekly_cap)
    }

    pub fn set_weekly_usage(&mut self, project_id: &str, tokens: u64) {
        self.weekly_usage.insert(project_id.to_string(), tokens);
    }

    pub fn weekly_usage(&self, project_id: &str) -> u64 {
        self.weekly_usage.get(project_id).copied().unwrap_or(0)
    }

    /// Start a new accounting week.
    pub fn reset_week(&mut self) {
        self.weekly_usage.clear();
    }

    pub async fn enqueue(&self, task: Task) -> String {
        self.queue.lock().await.enqueue(task)
    }

    /// Explicitly give postponed tasks another chance in the next round.
    pub async fn requeue_postponed(&self) -> usize {
        let count = self.queue.lock().await.requeue_postponed();
        if count > 0 {
            info!(count, "requeued postponed tasks");
        }
        count
    }

    /// One dispatch round: at most one task per project.
    ///
    /// Each task passes the backpressure gate and then the budget gate.
    /// Postponed tasks are not retried within the round.
    pub async fn run(&mut self) -> Result<DispatchRound> {
        let ready = self.queue.lock().await.dequeue_ready();
        let mut round = DispatchRound::default();

        for task in ready {
            let project_id = task.project_id.clone();
            let task_id = task.id.clone();
            let est_tokens = self.dispatcher.estimate(&task);

            let used = self.weekly_usage(&project_id);
            let projected = used.saturating_add(est_tokens);
            let threshold = self.backpressure_ratio * self.weekly_cap(&project_id) as f64;

            let hold = if projected as f64 > threshold {
                Some(PostponeReason::Backpressure {
                    projected,
                    threshold,
                })
            } else if self
                .cost_monitor
                .read()
                .await
                .will_exceed(&project_id, est_tokens)
            {
                Some(PostponeReason::BudgetExceeded { est_tokens })
            } else {
                None
            };

            if let Some(reason) = hold {
                warn!(project_id = %project_id, task_id = %task_id, %reason, "postponing task");
                self.queue.lock().await.postpone(&task_id, reason.to_string())?;
                self.emit(&task, est_tokens, DispatchDecision::Postponed {
                    reason: reason.to_string(),
                });
                round.postponed.push((task_id, reason));
                continue;
            }

            // Marked before handing off: the result event may race this round.
            self.queue.lock().await.mark_dispatched(&task_id)?;
            match self.dispatcher.dispatch(task.clone()) {
                Ok(()) => {
                    self.weekly_usage.insert(project_id.clone(), projected);
                    debug!(project_id = %project_id, task_id = %task_id, est_tokens, "dispatched task");
                    self.emit(&task, est_tokens, DispatchDecision::Dispatched);
                    round.dispatched.push(task_id);
                }
                Err(err) => {
                    let reason = err.to_string();
                    warn!(project_id = %project_id, task_id = %task_id, %reason, "dispatch refused");
                    self.queue.lock().await.fail(&task_id, reason.clone())?;
                    self.emit(&task, est_tokens, DispatchDecision::Failed {
                        reason: reason.clone(),
                    });
                    round.failed.push((task_id, reason));
                }
            }
        }

        if !round.is_empty() {
            info!(
                dispatched = round.dispatched.len(),
                postponed = round.postponed.len(),
                failed = round.failed.len(),
                "dispatch round finished"
            );
        }
        Ok(round)
    }

    fn emit(&self, task: &Task, est_tokens: u64, decision: DispatchDecision) {
        self.telemetry.record(TelemetryRecord::Dispatch {
            project_id: task.project_id.clone(),
            task_id: task.id.clone(),
            est_tokens,
            decision,
        });
    }
}
