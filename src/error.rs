use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Agent {agent_id} is busy with task {task_id}")]
    AgentBusy { agent_id: String, task_id: String },

    #[error("Task not found: {requested} (current task: {})", .current.as_deref().unwrap_or("none"))]
    TaskNotFound {
        requested: String,
        current: Option<String>,
    },

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    #[error("Step '{step}' timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    #[error("Step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Signal '{signal}' payload is missing required fields: {}", .missing.join(", "))]
    ExternalSignalMismatch { signal: String, missing: Vec<String> },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal invariant violated: {0}")]
    InternalInvariantViolation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Short machine-readable kind, used in command replies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::TomlParse(_) => "toml_parse",
            Error::NoHomeDir => "no_home_dir",
            Error::Validation(_) => "validation",
            Error::AgentBusy { .. } => "agent_busy",
            Error::TaskNotFound { .. } => "task_not_found",
            Error::UnknownAgent(_) => "unknown_agent",
            Error::UnknownWorkflow(_) => "unknown_workflow",
            Error::InvalidParams(_) => "invalid_params",
            Error::StepTimeout { .. } => "step_timeout",
            Error::StepFailed { .. } => "step_failed",
            Error::ExternalSignalMismatch { .. } => "external_signal_mismatch",
            Error::Cancelled(_) => "cancelled",
            Error::InternalInvariantViolation(_) => "internal_invariant_violation",
            Error::TaskJoin(_) => "task_join",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
