//! Actuator client interface and an in-process mock.
//!
//! Each agent (robot arm, PLC) is driven through an `ActuatorClient`. A call
//! is a blocking request/response to the agent's controller; `peek` reads
//! the latest message on a status topic without waiting. Timeouts and
//! cancellation are enforced by the caller, not by the client.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use crate::workflow::catalog::{
    CLEAN_DONE, CLEAN_STATE_TOPIC, DETECT_SAMPLE_READY, DETECT_STATE_TOPIC,
};
use crate::workflow::{NAVIGATION_DONE, NAVIGATION_TOPIC};
use crate::{flog_debug, Error, Payload, Result};

/// One request to an agent's controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorCall {
    pub agent_id: String,
    pub service: String,
    pub action: String,
    #[serde(default)]
    pub args: Payload,
}

impl ActuatorCall {
    pub fn new(agent_id: &str, service: &str, action: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            service: service.to_string(),
            action: action.to_string(),
            args: Payload::new(),
        }
    }

    pub fn with_args(mut self, args: Payload) -> Self {
        self.args = args;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActuatorReply {
    pub ok: bool,
    #[serde(default)]
    pub payload: Payload,
}

impl ActuatorReply {
    pub fn success() -> Self {
        Self {
            ok: true,
            payload: Payload::new(),
        }
    }

    pub fn failure(message: &str) -> Self {
        let mut payload = Payload::new();
        payload.insert("message".to_string(), message.into());
        Self { ok: false, payload }
    }

    /// Failure reason reported by the controller, if any.
    pub fn message(&self) -> Option<&str> {
        self.payload.get("message").and_then(|v| v.as_str())
    }
}

#[async_trait]
pub trait ActuatorClient: Send + Sync {
    /// Issue a request and wait for the controller's reply.
    async fn call(&self, call: &ActuatorCall) -> Result<ActuatorReply>;

    /// Latest message on `topic`, if one has been published.
    async fn peek(&self, topic: &str) -> Option<Payload>;
}

/// Scripted response for one action.
#[derive(Debug, Clone)]
pub struct MockResponse {
    pub delay: Duration,
    pub reply: std::result::Result<ActuatorReply, String>,
}

impl MockResponse {
    pub fn ok() -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Ok(ActuatorReply::success()),
        }
    }

    /// Controller answers with `ok == false`.
    pub fn fail(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Ok(ActuatorReply::failure(message)),
        }
    }

    /// Transport-level error, the call never gets a reply.
    pub fn error(message: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            reply: Err(message.to_string()),
        }
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Attach a payload to the controller's reply.
    pub fn with_payload(mut self, payload: Payload) -> Self {
        if let Ok(reply) = &mut self.reply {
            reply.payload.extend(payload);
        }
        self
    }
}

#[derive(Default)]
struct MockInner {
    responses: HashMap<String, MockResponse>,
    topics: HashMap<String, VecDeque<Payload>>,
    calls: Vec<ActuatorCall>,
}

/// In-process stand-in for a robot or PLC controller.
///
/// Unscripted actions succeed after `default_delay`. Topic queues hand out
/// messages in order and keep returning the last one once drained.
#[derive(Default)]
pub struct MockActuator {
    default_delay: Duration,
    inner: Mutex<MockInner>,
}

impl MockActuator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// A mock that behaves like a healthy controller: short action delays
    /// and latched status topics that report arrival, a ready sample and a
    /// finished clean.
    pub fn simulated() -> Self {
        let mock = Self::new().with_default_delay(Duration::from_millis(50));
        let mut finished = Payload::new();
        finished.insert(
            "state".to_string(),
            serde_json::json!({ "value": NAVIGATION_DONE }),
        );
        mock.publish(NAVIGATION_TOPIC, finished);
        for (topic, value) in [(DETECT_STATE_TOPIC, DETECT_SAMPLE_READY), (CLEAN_STATE_TOPIC, CLEAN_DONE)] {
            let mut state = Payload::new();
            state.insert("value".to_string(), serde_json::json!(value));
            mock.publish(topic, state);
        }
        mock
    }

    pub fn script(&self, action: &str, response: MockResponse) {
        self.inner
            .lock()
            .responses
            .insert(action.to_string(), response);
    }

    pub fn publish(&self, topic: &str, message: Payload) {
        self.inner
            .lock()
            .topics
            .entry(topic.to_string())
            .or_default()
            .push_back(message);
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.inner.lock().calls.clone()
    }

    pub fn call_count(&self, action: &str) -> usize {
        self.inner
            .lock()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .count()
    }

    pub fn actions(&self) -> Vec<String> {
        self.inner
            .lock()
            .calls
            .iter()
            .map(|c| c.action.clone())
            .collect()
    }
}

#[async_trait]
impl ActuatorClient for MockActuator {
    async fn call(&self, call: &ActuatorCall) -> Result<ActuatorReply> {
        let response = {
            let mut inner = self.inner.lock();
            inner.calls.push(call.clone());
            inner.responses.get(&call.action).cloned()
        };
        let response = response.unwrap_or_else(|| MockResponse::ok().after(self.default_delay));
        flog_debug!(
            "mock",
            "{} {}::{} (delay {:?})",
            call.agent_id,
            call.service,
            call.action,
            response.delay
        );

        if !response.delay.is_zero() {
            tokio::time::sleep(response.delay).await;
        }
        response.reply.map_err(|reason| Error::StepFailed {
            step: call.action.clone(),
            reason,
        })
    }

    async fn peek(&self, topic: &str) -> Option<Payload> {
        let mut inner = self.inner.lock();
        let queue = inner.topics.get_mut(topic)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}
