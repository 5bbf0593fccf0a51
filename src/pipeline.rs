//! Built-in delivery pipeline used by the `simulate` command.
//!
//! ```text
//! IDEATION -> PLANNING -> BUILD[IMPLEMENTATION -> REVIEW] -> DONE
//! ```
//!
//! `REVIEW` can send work back to `IMPLEMENTATION`, and every `BUILD`
//! substate inherits the `BUILD -> PLANNING` replanning edge.

use serde_json::Value;

use crate::error::Result;
use crate::state_machine::{Context, Engine, StateBehavior, Transition};

pub const IDEATION: &str = "IDEATION";
pub const PLANNING: &str = "PLANNING";
pub const BUILD: &str = "BUILD";
pub const IMPLEMENTATION: &str = "IMPLEMENTATION";
pub const REVIEW: &str = "REVIEW";
pub const DONE: &str = "DONE";

/// Counts entries into a stage under `visits.<STAGE>` in the project context.
#[derive(Debug, Clone)]
pub struct StageState {
    name: &'static str,
}

impl StageState {
    pub fn new(name: &'static str) -> Self {
        Self { name }
    }
}

impl StateBehavior for StageState {
    fn enter(&mut self, context: &mut Context) {
        let key = format!("visits.{}", self.name);
        let visits = context.get(&key).and_then(Value::as_u64).unwrap_or(0);
        context.insert(key, Value::from(visits + 1));
    }
}

pub fn build_engine() -> Result<Engine> {
    let mut engine = Engine::new();
    engine.add_state(IDEATION, StageState::new(IDEATION));
    engine.add_state(PLANNING, StageState::new(PLANNING));
    engine.add_state(BUILD, StageState::new(BUILD));
    engine.add_substate(IMPLEMENTATION, BUILD, StageState::new(IMPLEMENTATION))?;
    engine.add_substate(REVIEW, BUILD, StageState::new(REVIEW))?;
    engine.add_state(DONE, StageState::new(DONE));

    // Own edges are proposed before inherited ones, and ties keep that order.
    for (from, to, confidence) in [
        (IDEATION, PLANNING, 0.9),
        (PLANNING, IMPLEMENTATION, 0.85),
        (IMPLEMENTATION, REVIEW, 0.8),
        (REVIEW, IMPLEMENTATION, 0.6),
        (REVIEW, DONE, 0.7),
        (BUILD, PLANNING, 0.3),
    ] {
        engine.add_transition(Transition::new(from, to, confidence))?;
    }
    Ok(engine)
}

/// The forward stage an agent proposes from `state`, if any.
pub fn next_stage(state: &str) -> Option<&'static str> {
    match state {
        IDEATION => Some(PLANNING),
        PLANNING => Some(IMPLEMENTATION),
        IMPLEMENTATION => Some(REVIEW),
        REVIEW => Some(DONE),
        _ => None,
    }
}
