use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::proposal::{TickContext, TransitionProposal};
use super::state::{Context, StateBehavior, Transition};
use crate::error::{OrchestratorError, Result};

struct StateNode {
    behavior: Box<dyn StateBehavior>,
    parent: Option<String>,
}

/// Persistable part of an engine: where it is and what it knows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub current_state: Option<String>,
    #[serde(default)]
    pub context: Context,
}

/// Hierarchical state machine owned by exactly one project.
///
/// States may be nested under a parent with [`Engine::add_substate`]. A
/// substate inherits the outgoing edges of its ancestors, and moving between
/// states exits and enters every level below their lowest common ancestor.
///
/// The engine is not internally synchronized; its owner must never run two
/// `next`/`advance` pairs for the same engine concurrently.
pub struct Engine {
    states: HashMap<String, StateNode>,
    transitions: Vec<Transition>,
    current_state: Option<String>,
    context: Context,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            states: HashMap::new(),
            transitions: Vec::new(),
            current_state: None,
            context: Context::new(),
        }
    }

    /// Register a top-level state. Re-registering a name replaces its behavior.
    pub fn add_state(&mut self, name: impl Into<String>, behavior: impl StateBehavior + 'static) {
        let name = name.into();
        let parent = self.states.remove(&name).and_then(|node| node.parent);
        self.states.insert(
            name,
            StateNode {
                behavior: Box::new(behavior),
                parent,
            },
        );
    }

    /// Register a state nested under an existing parent.
    pub fn add_substate(
        &mut self,
        name: impl Into<String>,
        parent: impl Into<String>,
        behavior: impl StateBehavior + 'static,
    ) -> Result<()> {
        let name = name.into();
        let parent = parent.into();
        if !self.states.contains_key(&parent) {
            return Err(OrchestratorError::UnknownState(parent));
        }
        if parent == name || self.lineage(&parent).contains(&name) {
            return Err(OrchestratorError::Config(format!(
                "state {name} cannot be nested under its own descendant {parent}"
            )));
        }
        self.states.insert(
            name,
            StateNode {
                behavior: Box::new(behavior),
                parent: Some(parent),
            },
        );
        Ok(())
    }

    /// Add a static edge. Both endpoints must already be registered.
    pub fn add_transition(&mut self, transition: Transition) -> Result<()> {
        for endpoint in [&transition.from_state, &transition.to_state] {
            if !self.states.contains_key(endpoint) {
                return Err(OrchestratorError::UnknownState(endpoint.clone()));
            }
        }
        self.transitions.push(transition);
        Ok(())
    }

    pub fn has_state(&self, name: &str) -> bool {
        self.states.contains_key(name)
    }

    pub fn parent_of(&self, name: &str) -> Option<&str> {
        self.states.get(name).and_then(|node| node.parent.as_deref())
    }

    pub fn state_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.states.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn current_state(&self) -> Option<&str> {
        self.current_state.as_deref()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.context
    }

    /// Set the starting state and context, firing its enter hooks once.
    pub fn set_initial_state(&mut self, name: &str, context: Context) -> Result<()> {
        if !self.has_state(name) {
            return Err(OrchestratorError::UnknownState(name.to_string()));
        }
        self.context = context;
        self.current_state = Some(name.to_string());
        let entering = self.lineage(name);
        self.fire_enter(&entering);
        Ok(())
    }

    /// Candidate transitions out of `state` for this tick.
    ///
    /// Own edges come first, then edges inherited from ancestors (nearest
    /// first), all reported as leaving `state`. Unknown states and states
    /// without outgoing edges yield an empty list.
    pub fn next(&self, state: &str, tick: &TickContext) -> Vec<TransitionProposal> {
        let mut lineage = self.lineage(state);
        lineage.reverse();

        let mut proposals = Vec::new();
        for level in &lineage {
            for edge in self.transitions.iter().filter(|t| &t.from_state == level) {
                let mut proposal = TransitionProposal::from_edge(edge, tick);
                proposal.from_state = state.to_string();
                proposals.push(proposal);
            }
        }
        proposals
    }

    /// Run the `act` hook of the current state.
    pub fn act(&mut self) -> Result<()> {
        let current = self
            .current_state
            .clone()
            .ok_or(OrchestratorError::NotInitialized)?;
        if let Some(node) = self.states.get_mut(&current) {
            node.behavior.act(&mut self.context);
        }
        Ok(())
    }

    /// Commit an already-arbitrated proposal.
    ///
    /// Rejects without mutating anything when the proposal does not leave
    /// the current state or targets a state outside the graph.
    pub fn advance(&mut self, proposal: &TransitionProposal) -> Result<()> {
        let current = self
            .current_state
            .clone()
            .ok_or(OrchestratorError::NotInitialized)?;

        if proposal.from_state != current {
            return Err(OrchestratorError::InvalidTransition {
                from: proposal.from_state.clone(),
                to: proposal.to_state.clone(),
                reason: format!("engine is in state {current}"),
            });
        }
        if !self.has_state(&proposal.to_state) {
            return Err(OrchestratorError::InvalidTransition {
                from: proposal.from_state.clone(),
                to: proposal.to_state.clone(),
                reason: "target state is not in the graph".to_string(),
            });
        }

        let (exiting, entering) = self.path_between(&current, &proposal.to_state);
        self.fire_exit(&exiting);
        self.current_state = Some(proposal.to_state.clone());
        self.fire_enter(&entering);
        Ok(())
    }

    pub fn serialize(&self) -> EngineSnapshot {
        EngineSnapshot {
            current_state: self.current_state.clone(),
            context: self.context.clone(),
        }
    }

    /// Restore a snapshot. The state held before the restore is exited and
    /// the restored state is entered, so hooks stay paired across restores.
    pub fn deserialize(&mut self, snapshot: EngineSnapshot) -> Result<()> {
        if let Some(name) = &snapshot.current_state
            && !self.has_state(name)
        {
            return Err(OrchestratorError::UnknownState(name.clone()));
        }

        if let Some(previous) = self.current_state.take() {
            let mut exiting = self.lineage(&previous);
            exiting.reverse();
            self.fire_exit(&exiting);
        }

        self.context = snapshot.context;
        self.current_state = snapshot.current_state;
        if let Some(name) = self.current_state.clone() {
            let entering = self.lineage(&name);
            self.fire_enter(&entering);
        }
        Ok(())
    }

    // Root-first chain of ancestors ending at `name`. Empty for unknown states.
    fn lineage(&self, name: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = self.states.get(name).map(|_| name.to_string());
        while let Some(current) = cursor {
            cursor = self.states.get(&current).and_then(|node| node.parent.clone());
            chain.push(current);
            if chain.len() > self.states.len() {
                break;
            }
        }
        chain.reverse();
        chain
    }

    // States to exit (deepest first) and enter (outermost first).
    fn path_between(&self, from: &str, to: &str) -> (Vec<String>, Vec<String>) {
        let from_chain = self.lineage(from);
        let to_chain = self.lineage(to);

        let common = from_chain
            .iter()
            .zip(&to_chain)
            .take_while(|(a, b)| a == b)
            .count();
        // The source and target themselves are always exited and entered.
        let keep = common
            .min(from_chain.len().saturating_sub(1))
            .min(to_chain.len().saturating_sub(1));

        let exiting = from_chain[keep..].iter().rev().cloned().collect();
        let entering = to_chain[keep..].to_vec();
        (exiting, entering)
    }

    fn fire_exit(&mut self, names: &[String]) {
        for name in names {
            if let Some(node) = self.states.get_mut(name) {
                node.behavior.exit(&mut self.context);
            }
        }
    }

    fn fire_enter(&mut self, names: &[String]) {
        for name in names {
            if let Some(node) = self.states.get_mut(name) {
                node.behavior.enter(&mut self.context);
            }
        }
    }
}
