//! Top-level driver.
//!
//! Events queue up between ticks. A tick drains the queue, groups events by
//! project and processes projects concurrently; within a project everything
//! runs under that project's mutex, so at most one transition is committed
//! per project per tick.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::arbiter::TransitionArbiter;
use crate::config::OrchestratorConfig;
use crate::cost::{Budget, CostMonitor, CostRecord, CostReport};
use crate::deadlock::{DeadlockDetector, RepeatedPair};
use crate::error::{OrchestratorError, Result};
use crate::event::Event;
use crate::memory::{ContextItem, Embedder, HashingEmbedder, MemoryManager, NewMessage, WarmEntry};
use crate::repository::{CommittedTransition, InMemoryRepository, Repository};
use crate::scheduler::TaskQueue;
use crate::state_machine::{Context, Engine, TransitionProposal};
use crate::telemetry::{TelemetryRecord, TelemetrySink, TracingSink};

/// Agent id under which the orchestrator records tokens declared by ticks.
pub const ORCHESTRATOR_AGENT_ID: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Active,
    /// The last evaluation produced no proposals.
    Idle,
    /// A deadlock was flagged; no commits until resumed.
    Halted,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProjectStatus::Active => "ACTIVE",
            ProjectStatus::Idle => "IDLE",
            ProjectStatus::Halted => "HALTED",
        };
        f.pad(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
}

/// Read-only view of one project for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectView {
    pub id: String,
    pub name: String,
    pub status: ProjectStatus,
    pub current_state: Option<String>,
    pub transitions: usize,
}

/// What happened to one project during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    Committed {
        transition: CommittedTransition,
    },
    NoProposals,
    /// The selected proposal was not committed; the budget would be exceeded.
    BudgetExceeded {
        est_tokens: u64,
    },
    /// The project is halted and nothing was committed.
    Halted,
    /// The transition was committed and then flagged; the project is now halted.
    DeadlockDetected {
        transition: CommittedTransition,
        pairs: Vec<RepeatedPair>,
    },
    /// The engine refused the selected proposal. Nothing was mutated.
    Rejected {
        reason: String,
    },
}

impl TickOutcome {
    pub fn transition(&self) -> Option<&CommittedTransition> {
        match self {
            TickOutcome::Committed { transition } | TickOutcome::DeadlockDetected { transition, .. } => {
                Some(transition)
            }
            _ => None,
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Committed { transition } => {
                write!(f, "committed {} -> {}", transition.from_state, transition.to_state)
            }
            TickOutcome::NoProposals => write!(f, "no proposals"),
            TickOutcome::BudgetExceeded { est_tokens } => {
                write!(f, "budget exceeded ({est_tokens} tokens)")
            }
            TickOutcome::Halted => write!(f, "halted"),
            TickOutcome::DeadlockDetected { transition, .. } => {
                write!(f, "deadlock after {} -> {}", transition.from_state, transition.to_state)
            }
            TickOutcome::Rejected { reason } => write!(f, "rejected: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    /// Number of events drained from the queue.
    pub events: usize,
    pub outcomes: BTreeMap<String, TickOutcome>,
    /// `(project_id, message)` for events that could not be applied.
    pub errors: Vec<(String, String)>,
}

impl TickReport {
    pub fn outcome(&self, project_id: &str) -> Option<&TickOutcome> {
        self.outcomes.get(project_id)
    }

    pub fn committed(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| outcome.transition().is_some())
            .count()
    }
}

struct ProjectRuntime {
    project: Project,
    engine: Engine,
    history: Vec<CommittedTransition>,
}

#[derive(Default)]
struct ProjectTick {
    outcome: Option<TickOutcome>,
    errors: Vec<String>,
}

pub struct Orchestrator {
    projects: RwLock<HashMap<String, Arc<Mutex<ProjectRuntime>>>>,
    arbiter: TransitionArbiter,
    cost_monitor: Arc<RwLock<CostMonitor>>,
    deadlock: RwLock<DeadlockDetector>,
    memory: RwLock<MemoryManager>,
    embedder: Arc<dyn Embedder>,
    repository: Arc<dyn Repository>,
    telemetry: Arc<dyn TelemetrySink>,
    task_queue: Option<Arc<Mutex<TaskQueue>>>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Mutex<mpsc::UnboundedReceiver<Event>>,
    tick_interval: Duration,
    retrieve_top: usize,
}

impl Orchestrator {
    /// Build an orchestrator with in-memory persistence, `tracing` telemetry
    /// and the hashing embedder.
    pub fn new(config: &OrchestratorConfig) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            projects: RwLock::new(HashMap::new()),
            arbiter: TransitionArbiter::new(),
            cost_monitor: Arc::new(RwLock::new(CostMonitor::new(config.budget()))),
            deadlock: RwLock::new(DeadlockDetector::new(config.deadlock_threshold)),
            memory: RwLock::new(MemoryManager::new(config.hot_window, config.decision_tag.clone())),
            embedder: Arc::new(HashingEmbedder::default()),
            repository: Arc::new(InMemoryRepository::new()),
            telemetry: Arc::new(TracingSink),
            task_queue: None,
            events_tx,
            events_rx: Mutex::new(events_rx),
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            retrieve_top: config.retrieve_top,
        }
    }

    pub fn with_repository(mut self, repository: Arc<dyn Repository>) -> Self {
        self.repository = repository;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Settle tasks of this queue when their completion or failure events arrive.
    pub fn with_task_queue(mut self, queue: Arc<Mutex<TaskQueue>>) -> Self {
        self.task_queue = Some(queue);
        self
    }

    /// Shared with the scheduler so dispatch admission sees committed spend.
    pub fn cost_monitor(&self) -> Arc<RwLock<CostMonitor>> {
        self.cost_monitor.clone()
    }

    pub fn event_sender(&self) -> mpsc::UnboundedSender<Event> {
        self.events_tx.clone()
    }

    pub fn enqueue_event(&self, event: Event) {
        // The receiver lives as long as `self`, so sending cannot fail here.
        let _ = self.events_tx.send(event);
    }

    /// Register a project and enter its initial state.
    pub async fn register_project(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
        mut engine: Engine,
        initial_state: &str,
        context: Context,
    ) -> Result<()> {
        let id = id.into();
        let mut projects = self.projects.write().await;
        if projects.contains_key(&id) {
            return Err(OrchestratorError::DuplicateProject(id));
        }
        engine.set_initial_state(initial_state, context)?;

        info!(project_id = %id, initial_state, "project registered");
        let runtime = ProjectRuntime {
            project: Project {
                id: id.clone(),
                name: name.into(),
                status: ProjectStatus::Active,
            },
            engine,
            history: Vec::new(),
        };
        projects.insert(id, Arc::new(Mutex::new(runtime)));
        Ok(())
    }

    /// Rehydrate a registered project from the repository.
    ///
    /// Returns `false` when no snapshot was stored. The deadlock detector is
    /// not replayed; detection starts fresh after a restore.
    pub async fn restore_project(&self, project_id: &str) -> Result<bool> {
        let handle = self.runtime(project_id).await?;
        let Some(snapshot) = self.repository.load_snapshot(project_id).await? else {
            return Ok(false);
        };
        let history = self.repository.transitions(project_id).await?;

        let mut runtime = handle.lock().await;
        runtime.engine.deserialize(snapshot)?;
        runtime.history = history;
        info!(
            project_id,
            state = runtime.engine.current_state().unwrap_or("-"),
            transitions = runtime.history.len(),
            "project restored"
        );
        Ok(true)
    }

    pub async fn set_budget(&self, project_id: &str, budget: Budget) -> Result<()> {
        self.runtime(project_id).await?;
        self.cost_monitor.write().await.set_budget(project_id, budget);
        Ok(())
    }

    /// Operator override: lift a deadlock halt and forget the detector's
    /// history for the project.
    pub async fn resume(&self, project_id: &str) -> Result<()> {
        let handle = self.runtime(project_id).await?;
        let mut runtime = handle.lock().await;
        self.lift_halt(project_id, &mut runtime.project).await;
        Ok(())
    }

    /// Process every queued event.
    pub async fn tick(&self) -> TickReport {
        let mut batches: BTreeMap<String, Vec<Event>> = BTreeMap::new();
        let mut events = 0;
        {
            let mut rx = self.events_rx.lock().await;
            while let Ok(event) = rx.try_recv() {
                events += 1;
                batches
                    .entry(event.project_id().to_string())
                    .or_default()
                    .push(event);
            }
        }

        let mut report = TickReport {
            events,
            ..TickReport::default()
        };
        if batches.is_empty() {
            return report;
        }

        let results = join_all(batches.into_iter().map(|(project_id, events)| async move {
            let result = self.process_project(&project_id, events).await;
            (project_id, result)
        }))
        .await;

        for (project_id, result) in results {
            match result {
                Ok(tick) => {
                    report
                        .errors
                        .extend(tick.errors.into_iter().map(|e| (project_id.clone(), e)));
                    if let Some(outcome) = tick.outcome {
                        report.outcomes.insert(project_id, outcome);
                    }
                }
                Err(err) => {
                    warn!(%project_id, error = %err, "project tick failed");
                    report.errors.push((project_id, err.to_string()));
                }
            }
        }

        debug!(
            events = report.events,
            committed = report.committed(),
            "tick finished"
        );
        report
    }

    /// Tick on a fixed interval until `shutdown` resolves. Returns the number
    /// of ticks run.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> usize {
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        let mut ticks = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick().await;
                    ticks += 1;
                }
            }
        }
        info!(ticks, "orchestrator loop stopped");
        ticks
    }

    pub async fn projects(&self) -> Vec<ProjectView> {
        let handles: Vec<Arc<Mutex<ProjectRuntime>>> =
            self.projects.read().await.values().cloned().collect();

        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            let runtime = handle.lock().await;
            views.push(ProjectView {
                id: runtime.project.id.clone(),
                name: runtime.project.name.clone(),
                status: runtime.project.status,
                current_state: runtime.engine.current_state().map(str::to_string),
                transitions: runtime.history.len(),
            });
        }
        views.sort_by(|a, b| a.id.cmp(&b.id));
        views
    }

    /// The last `n` committed transitions, oldest first.
    pub async fn recent_transitions(&self, project_id: &str, n: usize) -> Result<Vec<CommittedTransition>> {
        let handle = self.runtime(project_id).await?;
        let runtime = handle.lock().await;
        let start = runtime.history.len().saturating_sub(n);
        Ok(runtime.history[start..].to_vec())
    }

    pub async fn cost_report(&self, project_id: &str) -> Result<CostReport> {
        self.runtime(project_id).await?;
        Ok(self.cost_monitor.read().await.report(project_id))
    }

    /// Context bundle for a decision. The warm tier is consulted only when a
    /// query is given; `top` defaults to the configured `retrieve_top`.
    pub async fn memory_context(
        &self,
        project_id: &str,
        query: Option<&str>,
        top: Option<usize>,
    ) -> Result<Vec<ContextItem>> {
        self.runtime(project_id).await?;
        let top = top.unwrap_or(self.retrieve_top);
        let embedding = match query {
            Some(text) => Some(
                self.embedder
                    .embed(text)
                    .await
                    .map_err(|e| OrchestratorError::Embedding(e.to_string()))?,
            ),
            None => None,
        };
        Ok(self
            .memory
            .read()
            .await
            .retrieve(project_id, embedding.as_deref(), top))
    }

    /// Compress the last `k` hot messages into a warm summary and archive the
    /// raw batch in the cold tier. Returns `None` when hot memory is empty.
    pub async fn summarize_hot(&self, project_id: &str, k: usize) -> Result<Option<WarmEntry>> {
        self.runtime(project_id).await?;
        let batch = self.memory.read().await.fetch_hot(project_id, k);
        if batch.is_empty() {
            return Ok(None);
        }

        let entry = MemoryManager::compress(&batch, self.embedder.as_ref())
            .await
            .map_err(|e| OrchestratorError::Embedding(e.to_string()))?;
        let archive = serde_json::to_vec(&batch)?;

        let mut memory = self.memory.write().await;
        memory.insert_warm(project_id, entry.clone());
        memory.store_cold(project_id, archive);
        debug!(project_id, messages = batch.len(), "hot memory summarized");
        Ok(Some(entry))
    }

    async fn runtime(&self, project_id: &str) -> Result<Arc<Mutex<ProjectRuntime>>> {
        self.projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownProject(project_id.to_string()))
    }

    async fn process_project(&self, project_id: &str, events: Vec<Event>) -> Result<ProjectTick> {
        let handle = self.runtime(project_id).await?;
        let mut runtime = handle.lock().await;

        let mut tick = ProjectTick::default();
        let mut proposals: Vec<TransitionProposal> = Vec::new();
        let mut est_tokens: u64 = 0;
        let mut evaluate = false;
        let mut acted = false;

        for event in events {
            match event {
                Event::Tick { context, .. } => {
                    // One act per project per tick, however many ticks were batched.
                    if !acted {
                        runtime.engine.act()?;
                        acted = true;
                    }
                    let current = runtime.engine.current_state().map(str::to_string);
                    if let Some(current) = current {
                        let next = runtime.engine.next(&current, &context);
                        proposals.extend(next);
                    }
                    est_tokens = est_tokens.saturating_add(context.est_tokens);
                    evaluate = true;
                }
                Event::TaskCompleted {
                    task_id,
                    agent_id,
                    output,
                    ..
                } => {
                    if let Err(err) = self.settle_task(&task_id, None).await {
                        tick.errors.push(err.to_string());
                    }
                    let record = self.cost_monitor.write().await.record(
                        project_id,
                        &agent_id,
                        output.tokens_used,
                        output.dollars,
                    );
                    if let Err(err) = self.repository.append_cost(&record).await {
                        warn!(project_id, %task_id, error = %err, "cost record not persisted");
                        tick.errors.push(err.to_string());
                    }

                    if let Some(note) = output.note {
                        let message = NewMessage {
                            agent_id,
                            role: "assistant".to_string(),
                            content: note,
                            token_count: u32::try_from(output.tokens_used).unwrap_or(u32::MAX),
                        };
                        self.memory.write().await.append_hot(project_id, message);
                    }
                    if let Some(proposal) = output.proposal {
                        proposals.push(proposal);
                    }
                    evaluate = true;
                }
                Event::TaskFailed {
                    task_id, failure, ..
                } => {
                    warn!(project_id, %task_id, %failure, "task failed");
                    if let Err(err) = self.settle_task(&task_id, Some(failure.to_string())).await {
                        tick.errors.push(err.to_string());
                    }
                }
                Event::Message { message, .. } => {
                    self.memory.write().await.append_hot(project_id, message);
                }
                Event::Resume { .. } => {
                    self.lift_halt(project_id, &mut runtime.project).await;
                }
            }
        }

        if evaluate {
            let outcome = self
                .decide(project_id, &mut runtime, proposals, est_tokens, &mut tick.errors)
                .await;
            tick.outcome = Some(outcome);
        }
        Ok(tick)
    }

    /// Arbitrate, gate on cost and commit at most one proposal.
    ///
    /// Once the engine has advanced the commit is final: persistence failures
    /// are pushed to `errors` and the outcome is still returned.
    async fn decide(
        &self,
        project_id: &str,
        runtime: &mut ProjectRuntime,
        proposals: Vec<TransitionProposal>,
        est_tokens: u64,
        errors: &mut Vec<String>,
    ) -> TickOutcome {
        if runtime.project.status == ProjectStatus::Halted {
            debug!(project_id, proposals = proposals.len(), "project halted, skipping commit");
            return TickOutcome::Halted;
        }

        let Some(index) = self.arbiter.select_index(project_id, &proposals) else {
            runtime.project.status = ProjectStatus::Idle;
            return TickOutcome::NoProposals;
        };
        let proposal = &proposals[index];
        let score = self.arbiter.score(proposal);

        let over_budget = self
            .cost_monitor
            .read()
            .await
            .will_exceed(project_id, est_tokens);
        if over_budget {
            warn!(project_id, est_tokens, "commit blocked by token budget");
            self.telemetry.record(TelemetryRecord::AdmissionRejected {
                project_id: project_id.to_string(),
                subject: format!("transition {} -> {}", proposal.from_state, proposal.to_state),
                reason: format!("{est_tokens} tokens would exceed the budget"),
            });
            return TickOutcome::BudgetExceeded { est_tokens };
        }

        if let Err(err) = runtime.engine.advance(proposal) {
            warn!(project_id, error = %err, "proposal rejected by engine");
            self.telemetry.record(TelemetryRecord::AdmissionRejected {
                project_id: project_id.to_string(),
                subject: format!("transition {} -> {}", proposal.from_state, proposal.to_state),
                reason: err.to_string(),
            });
            return TickOutcome::Rejected {
                reason: err.to_string(),
            };
        }
        runtime.project.status = ProjectStatus::Active;

        let cost_record = if est_tokens > 0 {
            let record = self.cost_monitor.write().await.record(
                project_id,
                ORCHESTRATOR_AGENT_ID,
                est_tokens,
                0.0,
            );
            Some(record)
        } else {
            None
        };

        let committed = CommittedTransition {
            project_id: project_id.to_string(),
            from_state: proposal.from_state.clone(),
            to_state: proposal.to_state.clone(),
            confidence: proposal.confidence,
            score,
            cost_tokens: est_tokens,
            metadata: proposal.metadata.clone(),
            committed_at: Utc::now(),
        };
        runtime.history.push(committed.clone());

        info!(
            project_id,
            from = %committed.from_state,
            to = %committed.to_state,
            score,
            "transition committed"
        );
        self.telemetry.record(TelemetryRecord::Commit {
            project_id: project_id.to_string(),
            from_state: committed.from_state.clone(),
            to_state: committed.to_state.clone(),
            score,
        });

        {
            let mut memory = self.memory.write().await;
            let content = format!(
                "{} {} -> {} (score {score:.3})",
                memory.decision_tag(),
                committed.from_state,
                committed.to_state
            );
            memory.append_hot(
                project_id,
                NewMessage {
                    agent_id: ORCHESTRATOR_AGENT_ID.to_string(),
                    role: "system".to_string(),
                    content,
                    token_count: 0,
                },
            );
        }

        let pairs = {
            let mut detector = self.deadlock.write().await;
            detector.observe(project_id, &committed.from_state, &committed.to_state);
            detector.repeated_pairs(project_id)
        };
        if !pairs.is_empty() {
            runtime.project.status = ProjectStatus::Halted;
            warn!(project_id, pairs = pairs.len(), "deadlock detected, project halted");
            self.telemetry.record(TelemetryRecord::DeadlockFlagged {
                project_id: project_id.to_string(),
                pairs: pairs.clone(),
            });
        }

        errors.extend(
            self.persist_commit(project_id, &runtime.engine, &committed, cost_record.as_ref())
                .await,
        );

        if pairs.is_empty() {
            TickOutcome::Committed {
                transition: committed,
            }
        } else {
            TickOutcome::DeadlockDetected {
                transition: committed,
                pairs,
            }
        }
    }

    /// Write the commit to the repository. Each write is attempted even when
    /// an earlier one failed; the failures are returned as messages.
    async fn persist_commit(
        &self,
        project_id: &str,
        engine: &Engine,
        committed: &CommittedTransition,
        cost_record: Option<&CostRecord>,
    ) -> Vec<String> {
        let mut results = Vec::with_capacity(3);
        if let Some(record) = cost_record {
            results.push(self.repository.append_cost(record).await);
        }
        results.push(
            self.repository
                .save_snapshot(project_id, &engine.serialize())
                .await,
        );
        results.push(self.repository.append_transition(committed).await);

        results
            .into_iter()
            .filter_map(|result| result.err())
            .inspect(|err| warn!(project_id, error = %err, "commit not persisted"))
            .map(|err| err.to_string())
            .collect()
    }

    async fn lift_halt(&self, project_id: &str, project: &mut Project) {
        if project.status != ProjectStatus::Halted {
            return;
        }
        self.deadlock.write().await.reset(project_id);
        project.status = ProjectStatus::Active;
        info!(project_id, "project resumed");
    }

    async fn settle_task(&self, task_id: &str, failure: Option<String>) -> Result<()> {
        let Some(queue) = &self.task_queue else {
            return Ok(());
        };
        let mut queue = queue.lock().await;
        match failure {
            None => queue.complete(task_id).map(|_| ()),
            Some(reason) => queue.fail(task_id, reason),
        }
    }
}
