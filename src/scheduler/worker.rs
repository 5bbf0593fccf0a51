use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{Notify, Semaphore, mpsc};
use tracing::{debug, warn};

use super::queue::Task;
use super::service::Dispatcher;
use crate::agent::Agent;
use crate::error::{FailureKind, OrchestratorError, Result};
use crate::event::Event;

type CancelMap = Arc<Mutex<HashMap<String, Arc<Notify>>>>;

/// Runs dispatched tasks on the tokio runtime.
///
/// Every task gets a deadline and a cancellation handle; its outcome is
/// delivered to the orchestrator as an [`Event`]. Concurrency is bounded by
/// a semaphore, and `dispatch` itself never waits.
pub struct WorkerPool {
    agent: Arc<dyn Agent>,
    events: mpsc::UnboundedSender<Event>,
    permits: Arc<Semaphore>,
    deadline: Duration,
    cancels: CancelMap,
}

impl WorkerPool {
    pub fn new(
        agent: Arc<dyn Agent>,
        events: mpsc::UnboundedSender<Event>,
        max_concurrent: usize,
        deadline: Duration,
    ) -> Self {
        Self {
            agent,
            events,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            deadline,
            cancels: Arc::default(),
        }
    }

    /// Signal a running or waiting task to stop. Returns false when the task
    /// is not known to the pool (never dispatched or already finished).
    pub fn cancel(&self, task_id: &str) -> bool {
        let cancels = self.cancels.lock().unwrap_or_else(|p| p.into_inner());
        match cancels.get(task_id) {
            Some(signal) => {
                signal.notify_one();
                true
            }
            None => false,
        }
    }

    pub fn running(&self) -> usize {
        self.cancels.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Dispatcher for WorkerPool {
    /// Asks the agent, which may size a task that declares nothing.
    fn estimate(&self, task: &Task) -> u64 {
        self.agent.estimate_tokens(task)
    }

    fn dispatch(&self, task: Task) -> Result<()> {
        if self.events.is_closed() {
            return Err(OrchestratorError::Dispatch("event channel closed".into()));
        }
        let runtime = Handle::try_current().map_err(|e| OrchestratorError::Dispatch(e.to_string()))?;

        let signal = Arc::new(Notify::new());
        self.cancels
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(task.id.clone(), signal.clone());

        let agent = self.agent.clone();
        let events = self.events.clone();
        let permits = self.permits.clone();
        let cancels = self.cancels.clone();
        let deadline = self.deadline;

        runtime.spawn(async move {
            let work = async {
                let _permit = match permits.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(FailureKind::System("worker pool closed".into())),
                };
                match tokio::time::timeout(deadline, agent.execute(&task)).await {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(FailureKind::Business(err.to_string())),
                    Err(_) => Err(FailureKind::System(format!(
                        "deadline of {}ms elapsed",
                        deadline.as_millis()
                    ))),
                }
            };

            let outcome = tokio::select! {
                result = work => result,
                _ = signal.notified() => Err(FailureKind::System("cancelled".into())),
            };

            cancels
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&task.id);

            let event = match outcome {
                Ok(output) => {
                    debug!(project_id = %task.project_id, task_id = %task.id, "task completed");
                    Event::TaskCompleted {
                        project_id: task.project_id.clone(),
                        task_id: task.id.clone(),
                        agent_id: agent.id().to_string(),
                        output,
                    }
                }
                Err(failure) => {
                    warn!(project_id = %task.project_id, task_id = %task.id, %failure, "task failed");
                    Event::TaskFailed {
                        project_id: task.project_id.clone(),
                        task_id: task.id.clone(),
                        failure,
                    }
                }
            };
            if events.send(event).is_err() {
                warn!(task_id = %task.id, "orchestrator dropped before task result was delivered");
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::Value;

    use super::*;
    use crate::agent::{AgentOutput, PayloadAgent};
    use crate::state_machine::TransitionProposal;

    struct SlowAgent;

    #[async_trait]
    impl Agent for SlowAgent {
        fn id(&self) -> &str {
            "slow"
        }

        fn estimate_tokens(&self, _task: &Task) -> u64 {
            1
        }

        async fn execute(&self, _task: &Task) -> anyhow::Result<AgentOutput> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            bail!("unreachable")
        }
    }

    struct BrokenAgent;

    #[async_trait]
    impl Agent for BrokenAgent {
        fn id(&self) -> &str {
            "broken"
        }

        fn estimate_tokens(&self, _task: &Task) -> u64 {
            1
        }

        async fn execute(&self, _task: &Task) -> anyhow::Result<AgentOutput> {
            bail!("model returned garbage")
        }
    }

    fn pool(agent: Arc<dyn Agent>, deadline: Duration) -> (WorkerPool, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (WorkerPool::new(agent, tx, 2, deadline), rx)
    }

    #[tokio::test]
    async fn completed_task_is_delivered_as_event() {
        let (pool, mut rx) = pool(Arc::new(PayloadAgent::new("planner", 0.0)), Duration::from_secs(5));
        let proposal = TransitionProposal::new("A", "B", 0.9, 0.1, 0.2, 0.3);
        let task = PayloadAgent::task("p1", &proposal, 10).with_id("t1");

        pool.dispatch(task).unwrap();
        match rx.recv().await.unwrap() {
            Event::TaskCompleted {
                project_id,
                task_id,
                agent_id,
                output,
            } => {
                assert_eq!(project_id, "p1");
                assert_eq!(task_id, "t1");
                assert_eq!(agent_id, "planner");
                assert_eq!(output.proposal, Some(proposal));
            }
            other => panic!("expected TaskCompleted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn agent_error_is_business_failure() {
        let (pool, mut rx) = pool(Arc::new(BrokenAgent), Duration::from_secs(5));
        pool.dispatch(Task::new("p1", 1, Value::Null).with_id("t1")).unwrap();
        match rx.recv().await.unwrap() {
            Event::TaskFailed { failure, .. } => {
                assert_eq!(failure, FailureKind::Business("model returned garbage".into()));
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_elapses_as_system_failure() {
        let (pool, mut rx) = pool(Arc::new(SlowAgent), Duration::from_millis(50));
        pool.dispatch(Task::new("p1", 1, Value::Null).with_id("t1")).unwrap();
        match rx.recv().await.unwrap() {
            Event::TaskFailed { failure, .. } => {
                assert_eq!(failure, FailureKind::System("deadline of 50ms elapsed".into()));
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
        assert_eq!(pool.running(), 0);
    }

    #[tokio::test]
    async fn cancel_stops_running_task() {
        let (pool, mut rx) = pool(Arc::new(SlowAgent), Duration::from_secs(3600));
        pool.dispatch(Task::new("p1", 1, Value::Null).with_id("t1")).unwrap();
        assert!(pool.cancel("t1"));
        assert!(!pool.cancel("unknown"));

        match rx.recv().await.unwrap() {
            Event::TaskFailed { task_id, failure, .. } => {
                assert_eq!(task_id, "t1");
                assert_eq!(failure, FailureKind::System("cancelled".into()));
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
    }

    #[test]
    fn estimate_comes_from_the_agent() {
        let (payload_pool, _rx) = pool(Arc::new(PayloadAgent::new("planner", 0.0)), Duration::from_secs(1));
        assert_eq!(payload_pool.estimate(&Task::new("p1", 25, Value::Null)), 25);

        // Nothing declared: the agent sizes the payload itself.
        let task = Task::new("p1", 0, serde_json::json!({ "note": "sixteen chars.." }));
        let expected = (task.payload.to_string().len() as u64).div_ceil(4);
        assert!(expected > 0);
        assert_eq!(payload_pool.estimate(&task), expected);

        let (slow_pool, _slow_rx) = pool(Arc::new(SlowAgent), Duration::from_secs(1));
        assert_eq!(slow_pool.estimate(&Task::new("p1", 25, Value::Null)), 1);
    }

    #[tokio::test]
    async fn closed_channel_refuses_dispatch() {
        let (pool, rx) = pool(Arc::new(BrokenAgent), Duration::from_secs(1));
        drop(rx);
        assert!(pool.dispatch(Task::new("p1", 1, Value::Null)).is_err());
    }

    #[test]
    fn dispatch_outside_runtime_is_refused() {
        let (pool, _rx) = pool(Arc::new(BrokenAgent), Duration::from_secs(1));
        assert!(matches!(
            pool.dispatch(Task::new("p1", 1, Value::Null)),
            Err(OrchestratorError::Dispatch(_))
        ));
    }
}
