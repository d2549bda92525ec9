pub mod actuator;
pub mod branch;
pub mod config;
pub mod error;
pub mod executor;
pub mod gate;
pub mod ingress;
pub mod log;
pub mod orchestrator;
pub mod state;
pub mod util;
pub mod workflow;
pub mod zone;

pub use error::{Error, Result};
pub use orchestrator::Orchestrator;
pub use state::{StepState, TaskQuery, TaskStatus};

/// Free-form JSON object carried by signals, actuator replies and task state.
pub type Payload = serde_json::Map<String, serde_json::Value>;
