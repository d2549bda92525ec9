//! Registry of the task each agent is tracking.
//!
//! Each agent has at most one slot. A slot stays queryable after its task
//! reaches a terminal status until the agent starts a new task or is reset.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::{flog_debug, Error, Result};

use super::machine::{StateHandle, StepState};

/// One agent's tracked task.
#[derive(Debug, Clone)]
pub struct TaskSlot {
    pub state: StateHandle,
    pub cancel: CancellationToken,
}

impl TaskSlot {
    pub fn task_id(&self) -> String {
        self.state.task_id()
    }

    pub fn is_live(&self) -> bool {
        !self.state.is_terminal()
    }
}

/// Lookup key for `GetTaskState`. At least one field must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

impl TaskQuery {
    pub fn by_task(task_id: &str) -> Self {
        Self {
            task_id: Some(task_id.to_string()),
            agent_id: None,
        }
    }

    pub fn by_agent(agent_id: &str) -> Self {
        Self {
            task_id: None,
            agent_id: Some(agent_id.to_string()),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, TaskSlot>,
    last_started: Option<String>,
}

#[derive(Debug, Default)]
pub struct TaskRegistry {
    inner: Mutex<Inner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a slot for `agent_id`, rejecting the call if the agent still
    /// has a live task. The check and the insert happen under one lock.
    pub fn try_insert(
        &self,
        task_id: &str,
        agent_id: &str,
        parent: &CancellationToken,
    ) -> Result<TaskSlot> {
        let mut inner = self.inner.lock();

        if let Some(existing) = inner.slots.get(agent_id) {
            if existing.is_live() {
                return Err(Error::AgentBusy {
                    agent_id: agent_id.to_string(),
                    task_id: existing.task_id(),
                });
            }
        }

        let duplicate = inner
            .slots
            .iter()
            .any(|(agent, slot)| agent != agent_id && slot.is_live() && slot.task_id() == task_id);
        if duplicate {
            return Err(Error::InvalidParams(format!(
                "task id {} is already running on another agent",
                task_id
            )));
        }

        let slot = TaskSlot {
            state: StateHandle::new(task_id, agent_id),
            cancel: parent.child_token(),
        };
        inner.slots.insert(agent_id.to_string(), slot.clone());
        inner.last_started = Some(task_id.to_string());
        flog_debug!("registry", "slot allocated: agent={} task={}", agent_id, task_id);
        Ok(slot)
    }

    pub fn get(&self, agent_id: &str) -> Option<TaskSlot> {
        self.inner.lock().slots.get(agent_id).cloned()
    }

    pub fn find_task(&self, task_id: &str) -> Option<TaskSlot> {
        self.inner
            .lock()
            .slots
            .values()
            .find(|slot| slot.task_id() == task_id)
            .cloned()
    }

    /// Id of the most recently started task, across all agents.
    pub fn last_started(&self) -> Option<String> {
        self.inner.lock().last_started.clone()
    }

    /// Resolve a query to a snapshot.
    ///
    /// When the task id does not match, the error carries the id that is
    /// actually tracked (for the named agent, or the latest started task).
    pub fn query(&self, query: &TaskQuery) -> Result<StepState> {
        match (&query.task_id, &query.agent_id) {
            (None, None) => Err(Error::InvalidParams(
                "either task_id or agent_id is required".to_string(),
            )),
            (task_id, Some(agent_id)) => {
                let slot = self.get(agent_id);
                let current = slot.as_ref().map(|s| s.task_id());
                match (slot, task_id) {
                    (Some(slot), None) => Ok(slot.state.snapshot()),
                    (Some(slot), Some(wanted)) if slot.task_id() == *wanted => {
                        Ok(slot.state.snapshot())
                    }
                    (_, wanted) => Err(Error::TaskNotFound {
                        requested: wanted.clone().unwrap_or_else(|| agent_id.clone()),
                        current,
                    }),
                }
            }
            (Some(task_id), None) => match self.find_task(task_id) {
                Some(slot) => Ok(slot.state.snapshot()),
                None => Err(Error::TaskNotFound {
                    requested: task_id.clone(),
                    current: self.last_started(),
                }),
            },
        }
    }

    /// Drop the agent's slot. Live tasks must be cancelled first.
    pub fn remove(&self, agent_id: &str) -> Result<Option<TaskSlot>> {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.slots.get(agent_id) {
            if slot.is_live() {
                return Err(Error::AgentBusy {
                    agent_id: agent_id.to_string(),
                    task_id: slot.task_id(),
                });
            }
        }
        let removed = inner.slots.remove(agent_id);
        if let Some(slot) = &removed {
            if inner.last_started.as_deref() == Some(slot.task_id().as_str()) {
                inner.last_started = None;
            }
        }
        Ok(removed)
    }

    pub fn live_slots(&self) -> Vec<TaskSlot> {
        self.inner
            .lock()
            .slots
            .values()
            .filter(|slot| slot.is_live())
            .cloned()
            .collect()
    }

    /// Snapshots of every tracked task, ordered by agent id.
    pub fn snapshots(&self) -> Vec<StepState> {
        let inner = self.inner.lock();
        let mut states: Vec<StepState> = inner.slots.values().map(|s| s.state.snapshot()).collect();
        states.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        states
    }
}
