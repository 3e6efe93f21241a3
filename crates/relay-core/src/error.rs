use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not initialized: run 'relay init'")]
    NotInitialized,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("cyclic pipeline: stages [{}] form a cycle", stages.join(", "))]
    CyclicPipeline { stages: Vec<String> },

    #[error("unreachable terminal: stage '{stage}' cannot reach any terminal stage")]
    UnreachableTerminal { stage: String },

    #[error("permission denied for {action}: {reason} (rule: {rule})")]
    PermissionDenied {
        action: String,
        rule: String,
        reason: String,
    },

    #[error("stage '{stage}' failed: {reason}")]
    StageFailure { stage: String, reason: String },

    #[error("stage '{stage}' timed out after {seconds}s")]
    Timeout { stage: String, seconds: u64 },

    #[error("invalid id '{0}': must be lowercase alphanumeric with hyphens or underscores")]
    InvalidId(String),

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("stage not found: {0}")]
    StageNotFound(String),

    #[error("no capability profile for role '{0}'")]
    ProfileNotFound(String),

    #[error("no actor bound for role '{0}'")]
    ActorNotBound(String),

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn config(msg: impl Into<String>) -> Self {
        RelayError::Configuration(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
