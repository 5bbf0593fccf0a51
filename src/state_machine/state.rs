use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Mutable per-project context blob handed to every state hook.
pub type Context = Map<String, Value>;

/// Free-form metadata attached to edges and proposals.
pub type Metadata = Map<String, Value>;

/// Project-specific behavior of a named state.
///
/// The engine calls `enter` when the state becomes active, `exit` when it is
/// left, and `act` once per orchestrator tick while it is current. All hooks
/// default to no-ops.
pub trait StateBehavior: Send {
    fn enter(&mut self, _context: &mut Context) {}

    fn exit(&mut self, _context: &mut Context) {}

    fn act(&mut self, _context: &mut Context) {}
}

/// A state with no behavior of its own. Used for graphs loaded from data.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveState;

impl StateBehavior for PassiveState {}

/// Static edge of the state graph. Immutable once added to an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_state: String,
    pub to_state: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Transition {
    pub fn new(from_state: impl Into<String>, to_state: impl Into<String>, confidence: f64) -> Self {
        Self {
            from_state: from_state.into(),
            to_state: to_state.into(),
            confidence,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from_state, self.to_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_display() {
        assert_eq!(Transition::new("IDEATION", "PLANNING", 0.9).to_string(), "IDEATION -> PLANNING");
    }

    #[test]
    fn transition_metadata_defaults_when_absent() {
        let t: Transition =
            serde_json::from_str(r#"{"from_state":"A","to_state":"B","confidence":0.5}"#).unwrap();
        assert!(t.metadata.is_empty());
        assert_eq!(t.confidence, 0.5);
    }

    #[test]
    fn passive_state_hooks_leave_context_untouched() {
        let mut ctx = Context::new();
        ctx.insert("k".into(), Value::from(1));
        let mut s = PassiveState;
        s.enter(&mut ctx);
        s.act(&mut ctx);
        s.exit(&mut ctx);
        assert_eq!(ctx.len(), 1);
    }
}
