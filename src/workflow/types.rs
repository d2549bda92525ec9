//! Step model for workflows.
//!
//! A workflow is an ordered list of `Step`s run against one agent. Steps can
//! address a different agent (a PLC, the second arm) through
//! `ActionStep::agent`; progress is always recorded on the task that owns the
//! list.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

use crate::state::{StepCode, StepDescriptor};
use crate::Payload;

/// Generate a task id for callers that do not supply one.
pub fn new_task_id() -> String {
    Uuid::new_v4().to_string()
}

/// A single request to an agent's controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub code: StepCode,
    #[serde(default)]
    pub description: String,
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub args: Payload,
    /// Agent that performs the action. Defaults to the task's agent.
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ActionStep {
    pub fn new(code: StepCode, service: &str, action: &str) -> Self {
        Self {
            code,
            description: code.label().to_string(),
            service: service.to_string(),
            action: action.to_string(),
            args: Payload::new(),
            agent: None,
            timeout_ms: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn arg(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.args.insert(key.to_string(), value.into());
        self
    }

    pub fn on(mut self, agent_id: &str) -> Self {
        self.agent = Some(agent_id.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// An action performed while holding a zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneStep {
    pub zone: String,
    pub call: ActionStep,
}

/// Steps run while holding a zone. The hold spans every nested step,
/// including waits on external signals, and ends with the block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonedStep {
    pub zone: String,
    #[serde(default)]
    pub description: String,
    /// Agent the hold is taken for. Defaults to the task's agent.
    #[serde(default)]
    pub agent: Option<String>,
    pub steps: Vec<Step>,
}

/// Park until an external signal arrives for the executing agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitStep {
    pub code: StepCode,
    #[serde(default)]
    pub description: String,
    pub signal: String,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl WaitStep {
    pub fn new(code: StepCode, signal: &str) -> Self {
        Self {
            code,
            description: code.label().to_string(),
            signal: signal.to_string(),
            required_fields: Vec::new(),
            agent: None,
            timeout_ms: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn require(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn on(mut self, agent_id: &str) -> Self {
        self.agent = Some(agent_id.to_string());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }
}

/// Re-read a status topic until a value at `pointer` reaches one of the
/// `done` or `failed` codes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollStep {
    pub code: StepCode,
    #[serde(default)]
    pub description: String,
    pub topic: String,
    /// JSON pointer into the topic message, e.g. `/state/value`.
    pub pointer: String,
    pub done: Vec<i64>,
    #[serde(default)]
    pub failed: Vec<i64>,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
}

/// Branches run concurrently and join at a barrier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelStep {
    #[serde(default)]
    pub description: String,
    pub branches: Vec<Branch>,
    #[serde(default)]
    pub join_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Branch {
    pub id: String,
    pub steps: Vec<Step>,
}

impl Branch {
    pub fn new(id: &str, steps: Vec<Step>) -> Self {
        Self {
            id: id.to_string(),
            steps,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Step {
    Call(ActionStep),
    ZoneCall(ZoneStep),
    Zoned(ZonedStep),
    WaitSignal(WaitStep),
    Poll(PollStep),
    Parallel(ParallelStep),
}

impl Step {
    pub fn zone_call(zone: &str, call: ActionStep) -> Self {
        Step::ZoneCall(ZoneStep {
            zone: zone.to_string(),
            call,
        })
    }

    pub fn zoned(zone: &str, steps: Vec<Step>) -> Self {
        Step::Zoned(ZonedStep {
            zone: zone.to_string(),
            description: String::new(),
            agent: None,
            steps,
        })
    }

    pub fn parallel(description: &str, branches: Vec<Branch>) -> Self {
        Step::Parallel(ParallelStep {
            description: description.to_string(),
            branches,
            join_timeout_ms: None,
        })
    }

    /// The descriptor recorded when this step starts.
    pub fn descriptor(&self) -> StepDescriptor {
        match self {
            Step::Call(call) => StepDescriptor::new(call.code, &call.description),
            Step::ZoneCall(z) => StepDescriptor::new(
                z.call.code,
                format!("{} @ {}", z.call.description, z.zone),
            ),
            Step::Zoned(z) if z.description.is_empty() => {
                StepDescriptor::new(StepCode::EnteringZone, format!("entering {}", z.zone))
            }
            Step::Zoned(z) => StepDescriptor::new(StepCode::EnteringZone, &z.description),
            Step::WaitSignal(w) => StepDescriptor::new(w.code, &w.description),
            Step::Poll(p) => StepDescriptor::new(p.code, &p.description),
            Step::Parallel(p) => {
                let ids: Vec<&str> = p.branches.iter().map(|b| b.id.as_str()).collect();
                let text = if p.description.is_empty() {
                    format!("branches: {}", ids.join(", "))
                } else {
                    format!("{} ({})", p.description, ids.join(", "))
                };
                StepDescriptor::new(StepCode::Parallel, text)
            }
        }
    }
}

pub(crate) fn millis(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(fallback)
}
