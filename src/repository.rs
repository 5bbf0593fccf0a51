//! Repository abstraction for orchestrator persistence.
//!
//! The orchestrator hands engine snapshots, committed transitions and cost
//! records to a [`Repository`]. Schema and durability belong to the
//! implementation; [`InMemoryRepository`] keeps everything in memory and
//! loses it on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::cost::CostRecord;
use crate::error::Result;
use crate::state_machine::{EngineSnapshot, Metadata};

/// A transition that was applied to a project's engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTransition {
    pub project_id: String,
    pub from_state: String,
    pub to_state: String,
    pub confidence: f64,
    pub score: f64,
    /// Tokens declared for the commit and admitted by the cost monitor.
    pub cost_tokens: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub committed_at: DateTime<Utc>,
}

#[async_trait]
pub trait Repository: Send + Sync {
    /// Store the latest snapshot for a project (upsert).
    async fn save_snapshot(&self, project_id: &str, snapshot: &EngineSnapshot) -> Result<()>;

    async fn load_snapshot(&self, project_id: &str) -> Result<Option<EngineSnapshot>>;

    /// Append to the project's committed-transition log.
    async fn append_transition(&self, transition: &CommittedTransition) -> Result<()>;

    async fn transitions(&self, project_id: &str) -> Result<Vec<CommittedTransition>>;

    /// Append to the project's cost log.
    async fn append_cost(&self, record: &CostRecord) -> Result<()>;

    async fn cost_records(&self, project_id: &str) -> Result<Vec<CostRecord>>;
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    snapshots: RwLock<HashMap<String, EngineSnapshot>>,
    transitions: RwLock<HashMap<String, Vec<CommittedTransition>>>,
    costs: RwLock<HashMap<String, Vec<CostRecord>>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn save_snapshot(&self, project_id: &str, snapshot: &EngineSnapshot) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(project_id.to_string(), snapshot.clone());
        Ok(())
    }

    async fn load_snapshot(&self, project_id: &str) -> Result<Option<EngineSnapshot>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(project_id).cloned())
    }

    async fn append_transition(&self, transition: &CommittedTransition) -> Result<()> {
        let mut transitions = self.transitions.write().await;
        transitions
            .entry(transition.project_id.clone())
            .or_default()
            .push(transition.clone());
        Ok(())
    }

    async fn transitions(&self, project_id: &str) -> Result<Vec<CommittedTransition>> {
        let transitions = self.transitions.read().await;
        Ok(transitions.get(project_id).cloned().unwrap_or_default())
    }

    async fn append_cost(&self, record: &CostRecord) -> Result<()> {
        let mut costs = self.costs.write().await;
        costs
            .entry(record.project_id.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    async fn cost_records(&self, project_id: &str) -> Result<Vec<CostRecord>> {
        let costs = self.costs.read().await;
        Ok(costs.get(project_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::state_machine::Context;

    fn committed(project_id: &str, from: &str, to: &str) -> CommittedTransition {
        CommittedTransition {
            project_id: project_id.into(),
            from_state: from.into(),
            to_state: to.into(),
            confidence: 0.9,
            score: 0.5,
            cost_tokens: 0,
            metadata: Metadata::new(),
            committed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn snapshot_upsert_and_load() {
        let repo = InMemoryRepository::new();
        assert!(repo.load_snapshot("p1").await.unwrap().is_none());

        let mut context = Context::new();
        context.insert("phase".into(), Value::from(1));
        let first = EngineSnapshot {
            current_state: Some("A".into()),
            context,
        };
        repo.save_snapshot("p1", &first).await.unwrap();
        let second = EngineSnapshot {
            current_state: Some("B".into()),
            context: Context::new(),
        };
        repo.save_snapshot("p1", &second).await.unwrap();

        assert_eq!(repo.load_snapshot("p1").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn transition_log_is_append_only_per_project() {
        let repo = InMemoryRepository::new();
        repo.append_transition(&committed("p1", "A", "B")).await.unwrap();
        repo.append_transition(&committed("p2", "X", "Y")).await.unwrap();
        repo.append_transition(&committed("p1", "B", "A")).await.unwrap();

        let log = repo.transitions("p1").await.unwrap();
        let pairs: Vec<(&str, &str)> = log
            .iter()
            .map(|t| (t.from_state.as_str(), t.to_state.as_str()))
            .collect();
        assert_eq!(pairs, vec![("A", "B"), ("B", "A")]);
        assert!(repo.transitions("p3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cost_log_roundtrip() {
        let repo = InMemoryRepository::new();
        let record = CostRecord {
            project_id: "p1".into(),
            agent_id: "a1".into(),
            tokens: 12,
            dollars: 0.5,
            recorded_at: Utc::now(),
        };
        repo.append_cost(&record).await.unwrap();
        assert_eq!(repo.cost_records("p1").await.unwrap(), vec![record]);
    }
}
