//! JSON command surface.
//!
//! Commands arrive as envelopes
//!
//! ```text
//! {"cmd_id": "c-17", "cmd_type": "START_TASK", "params": {"agent_id": "robot_a", "workflow": "scan_qrcode"}}
//! ```
//!
//! and every command gets exactly one reply
//!
//! ```text
//! {"cmd_id": "c-17", "success": true, "message": "...", "data": {...}}
//! ```
//!
//! The transport that carries these lines is not part of this crate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::str::FromStr;
use std::sync::Arc;

use crate::orchestrator::Orchestrator;
use crate::state::{StepState, TaskQuery};
use crate::workflow::{Step, SCAN_ENTER_ID_SIGNAL};
use crate::{flog, flog_debug, flog_warn, Error, Payload, Result};

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub cmd_id: String,
    pub cmd_type: String,
    #[serde(default)]
    pub params: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub cmd_id: String,
    pub success: bool,
    pub message: String,
    pub data: Value,
}

impl Reply {
    fn ok(cmd_id: &str, message: impl Into<String>, data: Value) -> Self {
        Self {
            cmd_id: cmd_id.to_string(),
            success: true,
            message: message.into(),
            data,
        }
    }

    fn from_error(cmd_id: &str, err: &Error) -> Self {
        let mut data = json!({ "error": err.kind() });
        if let Error::TaskNotFound { current, .. } = err {
            data["current_task_id"] = json!(current);
        }
        Self {
            cmd_id: cmd_id.to_string(),
            success: false,
            message: err.to_string(),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    StartTask,
    GetTaskState,
    FulfillSignal,
    CancelTask,
    ResetAgent,
    ListTasks,
    ZoneStatus,
    GateStatus,
    ListWorkflows,
    /// Shorthand for `FULFILL_SIGNAL` with the scan id signal.
    ScanQrcodeEnterId,
}

impl FromStr for CommandType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "START_TASK" => Ok(CommandType::StartTask),
            "GET_TASK_STATE" => Ok(CommandType::GetTaskState),
            "FULFILL_SIGNAL" => Ok(CommandType::FulfillSignal),
            "CANCEL_TASK" => Ok(CommandType::CancelTask),
            "RESET_AGENT" => Ok(CommandType::ResetAgent),
            "LIST_TASKS" => Ok(CommandType::ListTasks),
            "ZONE_STATUS" => Ok(CommandType::ZoneStatus),
            "GATE_STATUS" => Ok(CommandType::GateStatus),
            "LIST_WORKFLOWS" => Ok(CommandType::ListWorkflows),
            "SCAN_QRCODE_ENTER_ID" => Ok(CommandType::ScanQrcodeEnterId),
            other => Err(Error::InvalidParams(format!("unknown cmd_type: {}", other))),
        }
    }
}

fn str_param<'a>(params: &'a Payload, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn required<'a>(params: &'a Payload, key: &str) -> Result<&'a str> {
    str_param(params, key).ok_or_else(|| Error::InvalidParams(format!("missing parameter: {}", key)))
}

fn object_param(params: &Payload, key: &str) -> Result<Payload> {
    match params.get(key) {
        None => Ok(Payload::new()),
        Some(Value::Object(map)) => Ok(map.clone()),
        Some(_) => Err(Error::InvalidParams(format!("{} must be an object", key))),
    }
}

fn query_from(params: &Payload) -> TaskQuery {
    TaskQuery {
        task_id: str_param(params, "task_id")
            .or_else(|| str_param(params, "target_cmd_id"))
            .map(str::to_string),
        agent_id: str_param(params, "agent_id").map(str::to_string),
    }
}

/// Snapshot as JSON with the derived duration attached.
pub fn state_json(state: &StepState) -> Result<Value> {
    let mut value = serde_json::to_value(state)?;
    value["duration_seconds"] = json!(state.duration().map(|d| d.as_secs_f64()));
    Ok(value)
}

pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Parse and handle one line of input.
    pub fn handle_line(&self, line: &str) -> Reply {
        match serde_json::from_str::<Command>(line) {
            Ok(cmd) => self.handle(cmd),
            Err(e) => {
                flog_warn!("ingress", "malformed command: {}", e);
                Reply::from_error("", &Error::Json(e))
            }
        }
    }

    pub fn handle(&self, cmd: Command) -> Reply {
        flog_debug!("ingress", "{} {} params={}", cmd.cmd_id, cmd.cmd_type, Value::Object(cmd.params.clone()));
        let result = cmd
            .cmd_type
            .parse::<CommandType>()
            .and_then(|kind| self.dispatch(kind, &cmd.params));
        match result {
            Ok((message, data)) => Reply::ok(&cmd.cmd_id, message, data),
            Err(err) => {
                flog!("ingress", "{} {} rejected: {}", cmd.cmd_id, cmd.cmd_type, err);
                Reply::from_error(&cmd.cmd_id, &err)
            }
        }
    }

    fn dispatch(&self, kind: CommandType, params: &Payload) -> Result<(String, Value)> {
        let orch = &self.orchestrator;
        match kind {
            CommandType::StartTask => self.start_task(params),
            CommandType::GetTaskState => {
                let state = orch.get_task_state(&query_from(params))?;
                Ok((format!("task {} is {}", state.task_id, state.status), state_json(&state)?))
            }
            CommandType::FulfillSignal => {
                let signal = required(params, "signal")?;
                let agent_id = required(params, "agent_id")?;
                let payload = object_param(params, "payload")?;
                self.deliver(signal, agent_id, payload)
            }
            CommandType::ScanQrcodeEnterId => {
                let agent_id = str_param(params, "agent_id").unwrap_or("robot_a");
                let mut payload = params.clone();
                payload.remove("agent_id");
                if let (Some(kind), Some(code)) = (str_param(params, "type"), str_param(params, "qrcode_id")) {
                    payload.insert("bottle_id".to_string(), json!(format!("{}_{}", kind, code)));
                }
                self.deliver(SCAN_ENTER_ID_SIGNAL, agent_id, payload)
            }
            CommandType::CancelTask => {
                let cancelled = orch.cancel_task(&query_from(params))?;
                let message = if cancelled {
                    "task cancelled"
                } else {
                    "task already finished"
                };
                Ok((message.to_string(), json!({ "cancelled": cancelled })))
            }
            CommandType::ResetAgent => {
                let agent_id = required(params, "agent_id")?;
                orch.reset(agent_id)?;
                Ok((format!("{} reset", agent_id), Value::Null))
            }
            CommandType::ListTasks => {
                let tasks = orch
                    .tasks()
                    .iter()
                    .map(state_json)
                    .collect::<Result<Vec<_>>>()?;
                Ok((format!("{} task(s)", tasks.len()), Value::Array(tasks)))
            }
            CommandType::ZoneStatus => Ok((
                "zone status".to_string(),
                serde_json::to_value(orch.zone_status())?,
            )),
            CommandType::GateStatus => {
                let gates = orch.gate_status();
                Ok((format!("{} armed gate(s)", gates.len()), serde_json::to_value(gates)?))
            }
            CommandType::ListWorkflows => Ok((
                "workflows".to_string(),
                serde_json::to_value(orch.workflows())?,
            )),
        }
    }

    fn start_task(&self, params: &Payload) -> Result<(String, Value)> {
        let agent_id = required(params, "agent_id")?;
        let task_id = str_param(params, "task_id");

        let state = match (params.get("steps"), str_param(params, "workflow")) {
            (Some(steps), _) => {
                let steps: Vec<Step> = serde_json::from_value(steps.clone())
                    .map_err(|e| Error::InvalidParams(format!("steps: {}", e)))?;
                let task_id = task_id.ok_or_else(|| {
                    Error::InvalidParams("task_id is required with explicit steps".to_string())
                })?;
                self.orchestrator.start_task(task_id, agent_id, steps)?
            }
            (None, Some(workflow)) => {
                let workflow_params = object_param(params, "params")?;
                self.orchestrator
                    .start_workflow(agent_id, workflow, &workflow_params, task_id)?
            }
            (None, None) => {
                return Err(Error::InvalidParams(
                    "either workflow or steps is required".to_string(),
                ))
            }
        };

        Ok((
            format!("task {} started on {}", state.task_id, agent_id),
            json!({ "task_id": state.task_id, "agent_id": state.agent_id }),
        ))
    }

    fn deliver(&self, signal: &str, agent_id: &str, payload: Payload) -> Result<(String, Value)> {
        let delivered = self.orchestrator.fulfill_signal(signal, agent_id, payload)?;
        let message = if delivered {
            format!("{} delivered to {}", signal, agent_id)
        } else {
            format!("no gate armed for {} on {}", signal, agent_id)
        };
        Ok((message, json!({ "delivered": delivered })))
    }
}
