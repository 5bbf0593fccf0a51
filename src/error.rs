use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Invalid transition {from} -> {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("Unknown state: {0}")]
    UnknownState(String),

    #[error("State machine has no current state. Call `set_initial_state` first.")]
    NotInitialized,

    #[error("Project not found: {0}")]
    UnknownProject(String),

    #[error("Project already registered: {0}")]
    DuplicateProject(String),

    #[error("Task not found: {0}")]
    UnknownTask(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Config error: {0}")]
    Config(String),

    /// A persistence backend failed to read or write.
    #[error("Repository error: {0}")]
    Repository(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Distinguishes between logic failures and infrastructure failures reported
/// by the execution collaborator.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Agent logic failed (bad output, validation error).
    Business(String),
    /// Infrastructure failed (deadline elapsed, cancelled, transport error).
    System(String),
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Business(msg) => write!(f, "Business failure: {msg}"),
            FailureKind::System(msg) => write!(f, "System failure: {msg}"),
        }
    }
}
