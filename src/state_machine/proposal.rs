use serde::{Deserialize, Serialize};

use super::state::{Metadata, Transition};

/// Clamp a caller-supplied feature score into `[0, 1]`. NaN maps to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// Per-tick feature scores supplied by the event that triggered the tick.
///
/// Absent fields default to 0.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickContext {
    #[serde(default)]
    pub urgency: f64,
    #[serde(default)]
    pub dependency: f64,
    #[serde(default)]
    pub user_intent: f64,
    /// Declared token cost of committing a proposal produced from this tick.
    #[serde(default)]
    pub est_tokens: u64,
}

impl TickContext {
    pub fn new(urgency: f64, dependency: f64, user_intent: f64) -> Self {
        Self {
            urgency,
            dependency,
            user_intent,
            est_tokens: 0,
        }
    }
}

/// Ephemeral candidate transition, scored and discarded within one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionProposal {
    pub from_state: String,
    pub to_state: String,
    /// Carried from the static edge. Not part of arbitration scoring.
    pub confidence: f64,
    pub urgency: f64,
    pub dependency: f64,
    pub user_intent: f64,
    #[serde(default)]
    pub metadata: Metadata,
}

impl TransitionProposal {
    /// Build a proposal with feature scores clamped into `[0, 1]`.
    pub fn new(
        from_state: impl Into<String>,
        to_state: impl Into<String>,
        confidence: f64,
        urgency: f64,
        dependency: f64,
        user_intent: f64,
    ) -> Self {
        Self {
            from_state: from_state.into(),
            to_state: to_state.into(),
            confidence,
            urgency: clamp_unit(urgency),
            dependency: clamp_unit(dependency),
            user_intent: clamp_unit(user_intent),
            metadata: Metadata::new(),
        }
    }

    /// Build a proposal for a static edge using the tick's feature scores.
    pub fn from_edge(edge: &Transition, tick: &TickContext) -> Self {
        let mut proposal = Self::new(
            edge.from_state.clone(),
            edge.to_state.clone(),
            edge.confidence,
            tick.urgency,
            tick.dependency,
            tick.user_intent,
        );
        proposal.metadata = edge.metadata.clone();
        proposal
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Feature scores re-clamped, for proposals that were deserialized or
    /// mutated after construction.
    pub fn features(&self) -> (f64, f64, f64) {
        (
            clamp_unit(self.urgency),
            clamp_unit(self.dependency),
            clamp_unit(self.user_intent),
        )
    }
}
