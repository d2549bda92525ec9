//! Single-shot gates for external signals.
//!
//! A workflow arms a gate keyed by `(signal, agent)`, then parks on it until
//! an operator or device delivers the matching signal. Each gate has exactly
//! one waiter and is fulfilled at most once. Dropping the `PendingGate`
//! retires it, so a workflow that unwinds never leaves a dangling gate behind.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{flog, flog_debug, flog_warn, Error, Payload, Result};

pub type GateId = u64;

/// How a wait on a gate ended.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    Fulfilled(Payload),
    TimedOut,
    Cancelled,
}

impl GateOutcome {
    pub fn is_fulfilled(&self) -> bool {
        matches!(self, GateOutcome::Fulfilled(_))
    }
}

/// Public view of an armed gate.
#[derive(Debug, Clone, Serialize)]
pub struct GateInfo {
    pub id: GateId,
    pub signal: String,
    pub agent_id: String,
    pub required_fields: Vec<String>,
    pub armed_at: DateTime<Utc>,
}

struct GateEntry {
    info: GateInfo,
    sender: oneshot::Sender<Payload>,
}

type GateKey = (String, String);

#[derive(Default)]
struct Inner {
    gates: HashMap<GateId, GateEntry>,
    by_key: HashMap<GateKey, GateId>,
}

#[derive(Default)]
pub struct GateTable {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl GateTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a gate with no required payload fields.
    pub fn arm(self: &Arc<Self>, signal: &str, agent_id: &str) -> Result<PendingGate> {
        self.arm_with(signal, agent_id, &[])
    }

    /// Arm a gate whose payload must contain every field in `required`.
    ///
    /// Fails if a gate for the same `(signal, agent)` key is still armed.
    pub fn arm_with(
        self: &Arc<Self>,
        signal: &str,
        agent_id: &str,
        required: &[String],
    ) -> Result<PendingGate> {
        let key = (signal.to_string(), agent_id.to_string());
        let (tx, rx) = oneshot::channel();

        let id = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.by_key.get(&key) {
                return Err(Error::InternalInvariantViolation(format!(
                    "gate {} already armed for signal {} on agent {}",
                    existing, signal, agent_id
                )));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
            let info = GateInfo {
                id,
                signal: signal.to_string(),
                agent_id: agent_id.to_string(),
                required_fields: required.to_vec(),
                armed_at: Utc::now(),
            };
            inner.gates.insert(id, GateEntry { info, sender: tx });
            inner.by_key.insert(key, id);
            id
        };

        flog_debug!("gate", "armed gate {} signal={} agent={}", id, signal, agent_id);
        Ok(PendingGate {
            id,
            signal: signal.to_string(),
            receiver: rx,
            table: Arc::clone(self),
        })
    }

    /// Deliver a payload to a gate by id.
    ///
    /// Returns `false` if the gate is unknown, already fulfilled, or its
    /// waiter has gone.
    pub fn fulfill(&self, id: GateId, payload: Payload) -> bool {
        let entry = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.gates.remove(&id) else {
                flog_debug!("gate", "fulfill for unknown gate {} ignored", id);
                return false;
            };
            let key = (entry.info.signal.clone(), entry.info.agent_id.clone());
            inner.by_key.remove(&key);
            entry
        };
        let delivered = entry.sender.send(payload).is_ok();
        if delivered {
            flog!(
                "gate",
                "gate {} fulfilled: signal={} agent={}",
                id,
                entry.info.signal,
                entry.info.agent_id
            );
        } else {
            flog_warn!("gate", "gate {} fulfilled after its waiter left", id);
        }
        delivered
    }

    /// Route a signal to the gate armed for `(signal, agent)`.
    ///
    /// `Ok(false)` when nothing is armed. A payload lacking required fields is
    /// rejected and the gate stays armed.
    pub fn fulfill_signal(&self, signal: &str, agent_id: &str, payload: Payload) -> Result<bool> {
        let id = {
            let inner = self.inner.lock();
            let key = (signal.to_string(), agent_id.to_string());
            let Some(id) = inner.by_key.get(&key).copied() else {
                flog_debug!(
                    "gate",
                    "no gate armed for signal={} agent={}, ignoring",
                    signal,
                    agent_id
                );
                return Ok(false);
            };
            if let Some(entry) = inner.gates.get(&id) {
                let missing: Vec<String> = entry
                    .info
                    .required_fields
                    .iter()
                    .filter(|field| !payload.contains_key(field.as_str()))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    return Err(Error::ExternalSignalMismatch {
                        signal: signal.to_string(),
                        missing,
                    });
                }
            }
            id
        };
        Ok(self.fulfill(id, payload))
    }

    pub fn is_armed(&self, signal: &str, agent_id: &str) -> bool {
        self.inner
            .lock()
            .by_key
            .contains_key(&(signal.to_string(), agent_id.to_string()))
    }

    /// Armed gates, oldest first.
    pub fn status(&self) -> Vec<GateInfo> {
        let inner = self.inner.lock();
        let mut gates: Vec<GateInfo> = inner.gates.values().map(|e| e.info.clone()).collect();
        gates.sort_by_key(|g| g.id);
        gates
    }

    fn retire(&self, id: GateId) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.gates.remove(&id) {
            let key = (entry.info.signal.clone(), entry.info.agent_id.clone());
            if inner.by_key.get(&key) == Some(&id) {
                inner.by_key.remove(&key);
            }
            flog_debug!("gate", "retired gate {} signal={}", id, entry.info.signal);
        }
    }
}

/// The waiter side of an armed gate.
pub struct PendingGate {
    id: GateId,
    signal: String,
    receiver: oneshot::Receiver<Payload>,
    table: Arc<GateTable>,
}

impl std::fmt::Debug for PendingGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGate")
            .field("id", &self.id)
            .field("signal", &self.signal)
            .finish_non_exhaustive()
    }
}

impl PendingGate {
    pub fn id(&self) -> GateId {
        self.id
    }

    pub fn signal(&self) -> &str {
        &self.signal
    }

    /// Park until the gate is fulfilled, `timeout` elapses, or `cancel` fires.
    ///
    /// The gate is retired on return whatever the outcome.
    pub async fn wait(mut self, timeout: Duration, cancel: &CancellationToken) -> GateOutcome {
        let outcome = tokio::select! {
            biased;
            received = &mut self.receiver => match received {
                Ok(payload) => GateOutcome::Fulfilled(payload),
                Err(_) => GateOutcome::Cancelled,
            },
            _ = cancel.cancelled() => GateOutcome::Cancelled,
            _ = tokio::time::sleep(timeout) => {
                // Closed first so a fulfill racing the timer either lands
                // before this read or sees the waiter gone.
                self.receiver.close();
                match self.receiver.try_recv() {
                    Ok(payload) => GateOutcome::Fulfilled(payload),
                    Err(_) => GateOutcome::TimedOut,
                }
            }
        };
        if outcome == GateOutcome::TimedOut {
            flog_warn!(
                "gate",
                "gate {} timed out after {:?} waiting for {}",
                self.id,
                timeout,
                self.signal
            );
        }
        outcome
    }
}

impl Drop for PendingGate {
    fn drop(&mut self) {
        self.receiver.close();
        self.table.retire(self.id);
    }
}
