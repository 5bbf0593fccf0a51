//! Execution collaborator seam.
//!
//! An [`Agent`] turns a dispatched [`Task`] into an optional transition
//! proposal plus the spend it incurred. Real agents call models; this crate
//! only ships [`PayloadAgent`], which replays a proposal stored in the task
//! payload.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::scheduler::Task;
use crate::state_machine::TransitionProposal;

/// What an agent reports back for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub proposal: Option<TransitionProposal>,
    #[serde(default)]
    pub tokens_used: u64,
    #[serde(default)]
    pub dollars: f64,
    /// Free text to append to the project's hot memory.
    #[serde(default)]
    pub note: Option<String>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn id(&self) -> &str;

    /// Declared token cost used by admission control before dispatch.
    fn estimate_tokens(&self, task: &Task) -> u64;

    async fn execute(&self, task: &Task) -> Result<AgentOutput>;
}

/// Replays the proposal stored under `payload.proposal`.
///
/// Spend is reported as the task's estimate, priced at `dollars_per_token`.
#[derive(Debug, Clone)]
pub struct PayloadAgent {
    id: String,
    dollars_per_token: f64,
}

impl PayloadAgent {
    pub fn new(id: impl Into<String>, dollars_per_token: f64) -> Self {
        Self {
            id: id.into(),
            dollars_per_token,
        }
    }

    /// Build a task whose payload this agent understands.
    pub fn task(project_id: &str, proposal: &TransitionProposal, est_tokens: u64) -> Task {
        Task::new(project_id, est_tokens, json!({ "proposal": proposal }))
    }
}

#[async_trait]
impl Agent for PayloadAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn estimate_tokens(&self, task: &Task) -> u64 {
        if task.est_tokens > 0 {
            return task.est_tokens;
        }
        // Roughly four characters per token.
        (task.payload.to_string().len() as u64).div_ceil(4)
    }

    async fn execute(&self, task: &Task) -> Result<AgentOutput> {
        let proposal = match task.payload.get("proposal") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(
                serde_json::from_value::<TransitionProposal>(raw.clone())
                    .map_err(|e| anyhow!("task {} carries a malformed proposal: {e}", task.id))?,
            ),
        };
        let tokens_used = self.estimate_tokens(task);
        let note = proposal
            .as_ref()
            .map(|p| format!("{} proposes {} -> {}", self.id, p.from_state, p.to_state));
        Ok(AgentOutput {
            proposal,
            tokens_used,
            dollars: tokens_used as f64 * self.dollars_per_token,
            note,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn payload_agent_replays_proposal() {
        let agent = PayloadAgent::new("planner", 0.001);
        let proposal = TransitionProposal::new("IDEATION", "PLANNING", 0.9, 0.5, 0.7, 0.2);
        let task = PayloadAgent::task("p1", &proposal, 100);

        let output = agent.execute(&task).await.unwrap();
        assert_eq!(output.proposal, Some(proposal));
        assert_eq!(output.tokens_used, 100);
        assert!((output.dollars - 0.1).abs() < 1e-9);
        assert_eq!(output.note.as_deref(), Some("planner proposes IDEATION -> PLANNING"));
    }

    #[tokio::test]
    async fn payload_without_proposal_yields_none() {
        let agent = PayloadAgent::new("planner", 0.0);
        let task = Task::new("p1", 0, json!({ "note": "just thinking" }));
        let output = agent.execute(&task).await.unwrap();
        assert!(output.proposal.is_none());
        assert!(output.tokens_used > 0);
    }

    #[tokio::test]
    async fn malformed_proposal_is_an_error() {
        let agent = PayloadAgent::new("planner", 0.0);
        let task = Task::new("p1", 1, json!({ "proposal": { "from_state": 3 } }));
        assert!(agent.execute(&task).await.is_err());
    }
}
