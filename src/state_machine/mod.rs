mod engine;
mod proposal;
mod state;

pub use engine::{Engine, EngineSnapshot};
pub use proposal::{TickContext, TransitionProposal, clamp_unit};
pub use state::{Context, Metadata, PassiveState, StateBehavior, Transition};
