use serde::{Deserialize, Serialize};

use crate::agent::AgentOutput;
use crate::error::FailureKind;
use crate::memory::NewMessage;
use crate::state_machine::TickContext;

/// External input consumed by the orchestrator.
///
/// Serialized as `{"type": "...", "payload": {...}}`; every payload names
/// the project it concerns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    /// Evaluate the project's own graph with these feature scores.
    Tick {
        project_id: String,
        #[serde(default)]
        context: TickContext,
    },
    /// A dispatched task finished.
    TaskCompleted {
        project_id: String,
        task_id: String,
        agent_id: String,
        output: AgentOutput,
    },
    /// A dispatched task failed, timed out or was cancelled.
    TaskFailed {
        project_id: String,
        task_id: String,
        failure: FailureKind,
    },
    /// Append a message to the project's hot memory.
    Message {
        project_id: String,
        message: NewMessage,
    },
    /// Operator override: lift a deadlock halt.
    Resume { project_id: String },
}

impl Event {
    pub fn project_id(&self) -> &str {
        match self {
            Event::Tick { project_id, .. }
            | Event::TaskCompleted { project_id, .. }
            | Event::TaskFailed { project_id, .. }
            | Event::Message { project_id, .. }
            | Event::Resume { project_id } => project_id,
        }
    }

    pub fn tick(project_id: impl Into<String>, context: TickContext) -> Self {
        Event::Tick {
            project_id: project_id.into(),
            context,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_wire_shape_is_type_and_payload() {
        let event = Event::tick("p1", TickContext::new(0.5, 0.7, 0.2));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tick");
        assert_eq!(json["payload"]["project_id"], "p1");
        assert_eq!(json["payload"]["context"]["dependency"], 0.7);
    }

    #[test]
    fn tick_context_may_be_omitted() {
        let event: Event =
            serde_json::from_str(r#"{"type":"tick","payload":{"project_id":"p9"}}"#).unwrap();
        assert_eq!(event.project_id(), "p9");
        assert_eq!(event, Event::tick("p9", TickContext::default()));
    }

    #[test]
    fn resume_parses() {
        let event: Event =
            serde_json::from_str(r#"{"type":"resume","payload":{"project_id":"p2"}}"#).unwrap();
        assert_eq!(event, Event::Resume { project_id: "p2".into() });
    }
}
