//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - An orchestrator wired to one scripted mock controller
//! - Short timeouts so failure paths finish quickly
//! - Polling for gates, zones and statuses

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use labflow::actuator::{ActuatorClient, MockActuator};
use labflow::config::Config;
use labflow::executor::Actuators;
use labflow::ingress::Dispatcher;
use labflow::state::StepCode;
use labflow::workflow::{ActionStep, Step, WaitStep};
use labflow::{Orchestrator, Payload, StepState, TaskQuery, TaskStatus};

pub const AGENTS: [&str; 3] = ["robot_a", "robot_b", "plc"];

/// Config with every timeout cut down to test scale.
pub fn fast_config() -> Config {
    let mut config = Config::with_defaults();
    config.timeouts.actuator_secs = 5;
    config.timeouts.gate_secs = 5;
    config.timeouts.zone_secs = 5;
    config.timeouts.join_secs = 5;
    config.timeouts.poll_interval_ms = 10;
    config.timeouts.poll_deadline_secs = 5;
    config
}

/// An orchestrator whose agents all talk to the same mock controller.
pub struct Harness {
    pub orch: Arc<Orchestrator>,
    pub mock: Arc<MockActuator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_parts(config, MockActuator::simulated().with_default_delay(Duration::ZERO))
    }

    /// Harness around a caller-prepared mock, e.g. one with no latched topics.
    pub fn with_parts(config: Config, mock: MockActuator) -> Self {
        let mock = Arc::new(mock);
        let mut actuators: Actuators = HashMap::new();
        for agent in AGENTS {
            let client: Arc<dyn ActuatorClient> = mock.clone();
            actuators.insert(agent.to_string(), client);
        }
        let orch = Orchestrator::new(config, actuators).expect("Failed to build orchestrator");
        Self {
            orch: Arc::new(orch),
            mock,
        }
    }

    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher::new(Arc::clone(&self.orch))
    }

    pub fn state(&self, agent_id: &str) -> StepState {
        self.orch
            .get_task_state(&TaskQuery::by_agent(agent_id))
            .expect("agent has no task")
    }

    /// Wait for the agent's task to finish, failing the test after 10s.
    pub async fn finish(&self, agent_id: &str) -> StepState {
        tokio::time::timeout(Duration::from_secs(10), self.orch.wait_for_task(agent_id))
            .await
            .expect("task did not finish in time")
            .expect("agent has no task")
    }

    pub async fn gate_armed(&self, signal: &str, agent_id: &str) -> bool {
        let gates = Arc::clone(self.orch.gates());
        wait_until(Duration::from_secs(5), || gates.is_armed(signal, agent_id)).await
    }

    pub async fn status_reaches(&self, agent_id: &str, status: TaskStatus) -> bool {
        wait_until(Duration::from_secs(5), || self.state(agent_id).status == status).await
    }
}

/// Poll `check` every 5ms until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn call(code: StepCode, action: &str) -> Step {
    Step::Call(ActionStep::new(code, "/test_service", action))
}

pub fn zone_call(zone: &str, action: &str) -> Step {
    Step::zone_call(zone, ActionStep::new(StepCode::PuttingDown, "/test_service", action))
}

pub fn wait_signal(signal: &str) -> WaitStep {
    WaitStep::new(StepCode::WaitingDevice, signal)
}

pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        other => panic!("payload must be an object, got {}", other),
    }
}
