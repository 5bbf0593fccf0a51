use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Lifecycle status of a task.
///
/// `Queued -> Dispatched`, `Queued -> Postponed -> Queued` (explicit requeue),
/// and any non-terminal status `-> Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    Queued,
    Dispatched,
    Postponed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "QUEUED"),
            TaskStatus::Dispatched => write!(f, "DISPATCHED"),
            TaskStatus::Postponed => write!(f, "POSTPONED"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// A unit of agent work for one project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub est_tokens: u64,
    #[serde(default)]
    pub payload: Value,
    pub status: TaskStatus,
    /// Number of times this task was handed out by `dequeue_ready`.
    pub attempts: u32,
    pub last_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(project_id: impl Into<String>, est_tokens: u64, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            est_tokens,
            payload,
            status: TaskStatus::Queued,
            attempts: 0,
            last_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    fn set_status(&mut self, status: TaskStatus, reason: Option<String>) {
        self.status = status;
        if reason.is_some() {
            self.last_reason = reason;
        }
        self.updated_at = Utc::now();
    }
}

/// Per-project FIFO queues plus side channels for postponed and failed work.
///
/// Tasks handed out by [`TaskQueue::dequeue_ready`] stay tracked as in-flight
/// until they are completed, postponed or failed.
#[derive(Debug, Default)]
pub struct TaskQueue {
    queues: BTreeMap<String, VecDeque<Task>>,
    in_flight: HashMap<String, Task>,
    postponed: Vec<Task>,
    failed: Vec<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, mut task: Task) -> String {
        task.set_status(TaskStatus::Queued, None);
        let id = task.id.clone();
        self.queues
            .entry(task.project_id.clone())
            .or_default()
            .push_back(task);
        id
    }

    /// Head of every non-empty project queue, at most one task per project.
    ///
    /// Projects are visited in a stable order.
    pub fn dequeue_ready(&mut self) -> Vec<Task> {
        let mut ready = Vec::new();
        for queue in self.queues.values_mut() {
            if let Some(mut task) = queue.pop_front() {
                task.attempts += 1;
                task.updated_at = Utc::now();
                self.in_flight.insert(task.id.clone(), task.clone());
                ready.push(task);
            }
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        ready
    }

    pub fn mark_dispatched(&mut self, task_id: &str) -> Result<()> {
        let task = self
            .in_flight
            .get_mut(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))?;
        task.set_status(TaskStatus::Dispatched, None);
        Ok(())
    }

    /// Move a queued or in-flight task to the postponed side channel.
    pub fn postpone(&mut self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        let mut task = self.take_active(task_id)?;
        task.set_status(TaskStatus::Postponed, Some(reason.into()));
        self.postponed.push(task);
        Ok(())
    }

    /// Terminally fail a task that is queued, in flight or postponed.
    pub fn fail(&mut self, task_id: &str, reason: impl Into<String>) -> Result<()> {
        let mut task = match self.take_active(task_id) {
            Ok(task) => task,
            Err(err) => {
                let idx = self
                    .postponed
                    .iter()
                    .position(|t| t.id == task_id)
                    .ok_or(err)?;
                self.postponed.remove(idx)
            }
        };
        task.set_status(TaskStatus::Failed, Some(reason.into()));
        self.failed.push(task);
        Ok(())
    }

    /// Forget an in-flight task whose result has arrived.
    pub fn complete(&mut self, task_id: &str) -> Result<Task> {
        self.in_flight
            .remove(task_id)
            .ok_or_else(|| OrchestratorError::UnknownTask(task_id.to_string()))
    }

    /// Put every postponed task back at the head of its project queue,
    /// preserving their relative order. Returns how many were requeued.
    pub fn requeue_postponed(&mut self) -> usize {
        let postponed = std::mem::take(&mut self.postponed);
        let count = postponed.len();
        for mut task in postponed.into_iter().rev() {
            task.set_status(TaskStatus::Queued, None);
            self.queues
                .entry(task.project_id.clone())
                .or_default()
                .push_front(task);
        }
        count
    }

    pub fn postponed(&self) -> &[Task] {
        &self.postponed
    }

    pub fn failed(&self) -> &[Task] {
        &self.failed
    }

    pub fn in_flight(&self) -> impl Iterator<Item = &Task> {
        self.in_flight.values()
    }

    pub fn pending(&self, project_id: &str) -> usize {
        self.queues.get(project_id).map_or(0, VecDeque::len)
    }

    pub fn is_idle(&self) -> bool {
        self.queues.is_empty() && self.in_flight.is_empty()
    }

    fn take_active(&mut self, task_id: &str) -> Result<Task> {
        if let Some(task) = self.in_flight.remove(task_id) {
            return Ok(task);
        }
        for queue in self.queues.values_mut() {
            if let Some(idx) = queue.iter().position(|t| t.id == task_id)
                && let Some(task) = queue.remove(idx)
            {
                return Ok(task);
            }
        }
        Err(OrchestratorError::UnknownTask(task_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_task(pid: &str, tid: &str, est_tokens: u64) -> Task {
        Task::new(pid, est_tokens, Value::Null).with_id(tid)
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.id.as_str()).collect()
    }

    #[test]
    fn dequeue_ready_takes_one_per_project() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        q.enqueue(make_task("p1", "t2", 1));
        q.enqueue(make_task("p2", "t3", 1));

        assert_eq!(ids(&q.dequeue_ready()), vec!["t1", "t3"]);
        assert_eq!(ids(&q.dequeue_ready()), vec!["t2"]);
        assert!(q.dequeue_ready().is_empty());
    }

    #[test]
    fn dequeue_tracks_in_flight_and_attempts() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        let ready = q.dequeue_ready();
        assert_eq!(ready[0].attempts, 1);
        assert!(!q.is_idle());

        q.mark_dispatched("t1").unwrap();
        assert_eq!(q.in_flight().next().unwrap().status, TaskStatus::Dispatched);

        let done = q.complete("t1").unwrap();
        assert_eq!(done.id, "t1");
        assert!(q.is_idle());
    }

    #[test]
    fn postpone_routes_to_side_channel_with_reason() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        q.dequeue_ready();
        q.postpone("t1", "backpressure").unwrap();

        let postponed = q.postponed();
        assert_eq!(ids(postponed), vec!["t1"]);
        assert_eq!(postponed[0].status, TaskStatus::Postponed);
        assert_eq!(postponed[0].last_reason.as_deref(), Some("backpressure"));
        assert_eq!(q.in_flight().count(), 0);
    }

    #[test]
    fn requeue_postponed_restores_head_of_queue_in_order() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        q.enqueue(make_task("p1", "t2", 1));
        q.enqueue(make_task("p1", "t3", 1));
        q.postpone("t1", "budget").unwrap();
        q.postpone("t2", "budget").unwrap();

        assert_eq!(q.requeue_postponed(), 2);
        assert!(q.postponed().is_empty());
        assert_eq!(q.pending("p1"), 3);
        assert_eq!(ids(&q.dequeue_ready()), vec!["t1"]);
        assert_eq!(ids(&q.dequeue_ready()), vec!["t2"]);
        assert_eq!(ids(&q.dequeue_ready()), vec!["t3"]);
    }

    #[test]
    fn fail_is_terminal_and_keeps_reason() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        q.enqueue(make_task("p2", "t2", 1));
        q.postpone("t2", "budget").unwrap();

        q.fail("t1", "agent crashed").unwrap();
        q.fail("t2", "operator gave up").unwrap();

        assert_eq!(ids(q.failed()), vec!["t1", "t2"]);
        assert!(q.failed().iter().all(|t| t.status == TaskStatus::Failed));
        assert_eq!(q.failed()[0].last_reason.as_deref(), Some("agent crashed"));
        assert!(q.postponed().is_empty());
        assert_eq!(q.requeue_postponed(), 0);
        assert!(q.is_idle());
    }

    #[test]
    fn unknown_task_operations_propagate() {
        let mut q = TaskQueue::new();
        assert!(matches!(
            q.postpone("nope", "x"),
            Err(OrchestratorError::UnknownTask(id)) if id == "nope"
        ));
        assert!(q.fail("nope", "x").is_err());
        assert!(q.complete("nope").is_err());
        assert!(q.mark_dispatched("nope").is_err());
    }

    #[test]
    fn failed_task_cannot_be_postponed() {
        let mut q = TaskQueue::new();
        q.enqueue(make_task("p1", "t1", 1));
        q.fail("t1", "bad").unwrap();
        assert!(q.postpone("t1", "later").is_err());
    }

    #[test]
    fn status_display() {
        assert_eq!(TaskStatus::Queued.to_string(), "QUEUED");
        assert_eq!(TaskStatus::Postponed.to_string(), "POSTPONED");
    }
}
