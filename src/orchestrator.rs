//! The orchestrator façade.
//!
//! Owns the task registry, zone lock, gate table and actuator clients, and
//! runs each started task on its own tokio task. At most one task per agent
//! is live at any time.

use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::actuator::{ActuatorClient, MockActuator};
use crate::config::Config;
use crate::executor::{run_task, Actuators, StepContext};
use crate::gate::{GateId, GateInfo, GateTable};
use crate::state::{StepState, TaskQuery, TaskRegistry};
use crate::workflow::{catalog, new_task_id, Step, WorkflowInfo, WORKFLOWS};
use crate::zone::{ZoneLock, ZoneStatus};
use crate::{flog, flog_warn, Error, Payload, Result};

pub struct Orchestrator {
    config: Config,
    registry: TaskRegistry,
    zones: Arc<ZoneLock>,
    gates: Arc<GateTable>,
    actuators: Arc<Actuators>,
    root: CancellationToken,
    tracker: TaskTracker,
}

impl Orchestrator {
    pub fn new(config: Config, actuators: Actuators) -> Result<Self> {
        config.validate()?;
        let zones = Arc::new(ZoneLock::from_config(&config.zones));
        let mut agents: Vec<&str> = actuators.keys().map(String::as_str).collect();
        agents.sort_unstable();
        flog!(
            "orchestrator",
            "ready: agents=[{}], conflict_pairs={}",
            agents.join(", "),
            config.zones.conflicts.len()
        );
        Ok(Self {
            config,
            registry: TaskRegistry::new(),
            zones,
            gates: Arc::new(GateTable::new()),
            actuators: Arc::new(actuators),
            root: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// Orchestrator with a simulated controller for every enabled agent.
    pub fn with_mocks(config: Config) -> Result<Self> {
        let actuators = config
            .enabled_agents()
            .map(|agent| {
                let client: Arc<dyn ActuatorClient> = Arc::new(MockActuator::simulated());
                (agent.id.clone(), client)
            })
            .collect::<HashMap<_, _>>();
        Self::new(config, actuators)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn zones(&self) -> &Arc<ZoneLock> {
        &self.zones
    }

    pub fn gates(&self) -> &Arc<GateTable> {
        &self.gates
    }

    /// Start running `steps` for `agent_id`.
    ///
    /// Rejected with `AgentBusy` if the agent's current task is still live.
    pub fn start_task(&self, task_id: &str, agent_id: &str, steps: Vec<Step>) -> Result<StepState> {
        if self.root.is_cancelled() {
            return Err(Error::Cancelled("orchestrator is shutting down".to_string()));
        }
        if !self.actuators.contains_key(agent_id) {
            return Err(Error::UnknownAgent(agent_id.to_string()));
        }
        if task_id.trim().is_empty() {
            return Err(Error::InvalidParams("task_id must not be empty".to_string()));
        }
        if steps.is_empty() {
            return Err(Error::InvalidParams("a task needs at least one step".to_string()));
        }

        let slot = self.registry.try_insert(task_id, agent_id, &self.root)?;
        let ctx = StepContext::new(
            agent_id,
            slot.state.clone(),
            slot.cancel.clone(),
            Arc::clone(&self.actuators),
            Arc::clone(&self.zones),
            Arc::clone(&self.gates),
            self.config.timeouts.clone(),
        );
        self.tracker.spawn(run_task(ctx, steps));
        flog!("orchestrator", "task {} accepted for {}", task_id, agent_id);
        Ok(slot.state.snapshot())
    }

    /// Start a catalog workflow. A task id is generated when none is given.
    pub fn start_workflow(
        &self,
        agent_id: &str,
        workflow: &str,
        params: &Payload,
        task_id: Option<&str>,
    ) -> Result<StepState> {
        let steps = catalog::build(workflow, agent_id, params)?;
        let task_id = task_id.map(str::to_string).unwrap_or_else(new_task_id);
        flog!(
            "orchestrator",
            "workflow {} requested for {} as task {}",
            workflow,
            agent_id,
            task_id
        );
        self.start_task(&task_id, agent_id, steps)
    }

    pub fn get_task_state(&self, query: &TaskQuery) -> Result<StepState> {
        self.registry.query(query)
    }

    pub fn tasks(&self) -> Vec<StepState> {
        self.registry.snapshots()
    }

    /// Deliver an external signal to the gate armed for `(signal, agent)`.
    pub fn fulfill_signal(&self, signal: &str, agent_id: &str, payload: Payload) -> Result<bool> {
        self.gates.fulfill_signal(signal, agent_id, payload)
    }

    pub fn fulfill_gate(&self, id: GateId, payload: Payload) -> bool {
        self.gates.fulfill(id, payload)
    }

    /// Cancel the task matching `query`.
    ///
    /// The state is marked `Cancelled` immediately; the running steps stop at
    /// their next suspension point. Returns `false` if the task had already
    /// finished.
    pub fn cancel_task(&self, query: &TaskQuery) -> Result<bool> {
        let state = self.registry.query(query)?;
        let slot = self
            .registry
            .get(&state.agent_id)
            .ok_or_else(|| Error::TaskNotFound {
                requested: state.task_id.clone(),
                current: None,
            })?;
        if !slot.is_live() {
            return Ok(false);
        }
        // State first: once the token fires the executor races to record its
        // own cancellation.
        let cancelled = slot.state.cancel("cancelled by request");
        slot.cancel.cancel();
        flog!(
            "orchestrator",
            "cancel task {} on {}: {}",
            state.task_id,
            state.agent_id,
            cancelled
        );
        Ok(cancelled)
    }

    /// Forget the agent's finished task so the slot is empty again.
    pub fn reset(&self, agent_id: &str) -> Result<()> {
        if let Some(slot) = self.registry.remove(agent_id)? {
            flog!("orchestrator", "reset {} (was task {})", agent_id, slot.task_id());
        }
        Ok(())
    }

    /// Wait for the agent's current task to reach a terminal state.
    pub async fn wait_for_task(&self, agent_id: &str) -> Result<StepState> {
        let slot = self.registry.get(agent_id).ok_or_else(|| Error::TaskNotFound {
            requested: agent_id.to_string(),
            current: self.registry.last_started(),
        })?;
        slot.state.wait_terminal().await;
        Ok(slot.state.snapshot())
    }

    pub fn zone_status(&self) -> ZoneStatus {
        self.zones.status()
    }

    pub fn gate_status(&self) -> Vec<GateInfo> {
        self.gates.status()
    }

    pub fn workflows(&self) -> &'static [WorkflowInfo] {
        WORKFLOWS
    }

    /// Cancel every live task and wait until their executions have unwound.
    pub async fn shutdown(&self) {
        let live = self.registry.live_slots();
        if !live.is_empty() {
            flog_warn!("orchestrator", "shutting down with {} live task(s)", live.len());
        }
        for slot in &live {
            slot.state.cancel("orchestrator shutting down");
        }
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        flog!("orchestrator", "shutdown complete");
    }
}
