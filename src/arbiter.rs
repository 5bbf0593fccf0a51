//! Arbitration between competing transition proposals.

use tracing::debug;

use crate::state_machine::TransitionProposal;

/// Weight of the urgency feature.
pub const URGENCY_WEIGHT: f64 = 0.3;
/// Weight of the dependency feature.
pub const DEPENDENCY_WEIGHT: f64 = 0.4;
/// Weight of the user-intent feature.
pub const USER_INTENT_WEIGHT: f64 = 0.3;

/// Scores proposals and picks one winner per project per tick.
///
/// A proposal's `confidence` is metadata only and never enters the score.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransitionArbiter;

impl TransitionArbiter {
    pub fn new() -> Self {
        Self
    }

    /// `0.3·urgency + 0.4·dependency + 0.3·user_intent`, on clamped features.
    pub fn score(&self, proposal: &TransitionProposal) -> f64 {
        let (urgency, dependency, user_intent) = proposal.features();
        URGENCY_WEIGHT * urgency + DEPENDENCY_WEIGHT * dependency + USER_INTENT_WEIGHT * user_intent
    }

    /// Index of the winning proposal, or `None` for empty input.
    ///
    /// Ties go to the earliest proposal so identical inputs always produce
    /// the same winner.
    pub fn select_index(&self, project_id: &str, proposals: &[TransitionProposal]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (idx, proposal) in proposals.iter().enumerate() {
            let score = self.score(proposal);
            match best {
                Some((_, top)) if score <= top => {}
                _ => best = Some((idx, score)),
            }
        }

        if let Some((idx, score)) = best {
            debug!(
                project_id,
                candidates = proposals.len(),
                winner = %format!("{} -> {}", proposals[idx].from_state, proposals[idx].to_state),
                score,
                "arbitrated transition proposals"
            );
        }
        best.map(|(idx, _)| idx)
    }

    /// The winning proposal, or `None` for empty input.
    pub fn select<'a>(
        &self,
        project_id: &str,
        proposals: &'a [TransitionProposal],
    ) -> Option<&'a TransitionProposal> {
        self.select_index(project_id, proposals)
            .map(|idx| &proposals[idx])
    }
}
