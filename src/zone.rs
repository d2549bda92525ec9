//! Mutual exclusion over named physical zones.
//!
//! Some zones share floor space with a partner zone (the transfer-side and
//! split-side cells of one staging area). Two different agents may never hold
//! a zone and its partner at the same time, nor share one protected zone.
//! Zones outside the conflict relation are never gated and leave no trace in
//! the occupancy table.
//!
//! Waiters park on a per-zone `Notify`; a release wakes the zone and its
//! partner. Holding is reentrant per agent.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::config::{ConflictPair, ZoneConfig};
use crate::{flog, flog_debug, flog_error, Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    TimedOut,
    Cancelled,
}

/// Snapshot of zone occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ZoneStatus {
    pub occupied: BTreeMap<String, String>,
    pub waiting: BTreeMap<String, Vec<String>>,
}

#[derive(Debug)]
struct Hold {
    agent_id: String,
    depth: usize,
}

#[derive(Default)]
struct Inner {
    holds: HashMap<String, Hold>,
    waiting: HashMap<String, Vec<String>>,
    notifies: HashMap<String, Arc<Notify>>,
}

impl Inner {
    fn holder(&self, zone: &str) -> Option<&str> {
        self.holds.get(zone).map(|h| h.agent_id.as_str())
    }

    fn notify_for(&mut self, zone: &str) -> Arc<Notify> {
        Arc::clone(
            self.notifies
                .entry(zone.to_string())
                .or_insert_with(|| Arc::new(Notify::new())),
        )
    }

    fn remove_waiter(&mut self, zone: &str, agent_id: &str) {
        if let Some(agents) = self.waiting.get_mut(zone) {
            if let Some(pos) = agents.iter().position(|a| a == agent_id) {
                agents.remove(pos);
            }
            if agents.is_empty() {
                self.waiting.remove(zone);
            }
        }
    }
}

pub struct ZoneLock {
    partners: HashMap<String, String>,
    inner: Mutex<Inner>,
}

impl ZoneLock {
    pub fn new(conflicts: &[ConflictPair]) -> Self {
        let mut partners = HashMap::new();
        for conflict in conflicts {
            let [a, b] = &conflict.pair;
            partners.insert(a.clone(), b.clone());
            partners.insert(b.clone(), a.clone());
        }
        Self {
            partners,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn from_config(config: &ZoneConfig) -> Self {
        Self::new(&config.conflicts)
    }

    pub fn partner(&self, zone: &str) -> Option<&str> {
        self.partners.get(zone).map(String::as_str)
    }

    pub fn is_protected(&self, zone: &str) -> bool {
        self.partners.contains_key(zone)
    }

    /// Take `zone` for `agent_id`, waiting up to `timeout`.
    pub async fn acquire(
        &self,
        agent_id: &str,
        zone: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> AcquireOutcome {
        if !self.is_protected(zone) {
            flog_debug!("zone", "{} passes through unprotected {}", agent_id, zone);
            return AcquireOutcome::Acquired;
        }
        let deadline = tokio::time::Instant::now() + timeout;
        let (notify, mut mark) = {
            let mut inner = self.inner.lock();
            if self.try_take(&mut inner, agent_id, zone) {
                return AcquireOutcome::Acquired;
            }
            inner
                .waiting
                .entry(zone.to_string())
                .or_default()
                .push(agent_id.to_string());
            let notify = inner.notify_for(zone);
            let mark = WaitMark {
                lock: self,
                zone,
                agent_id,
                active: true,
            };
            (notify, mark)
        };

        flog!(
            "zone",
            "{} waiting for {} (held: {:?})",
            agent_id,
            zone,
            self.blocking_holder(agent_id, zone)
        );

        loop {
            // Register before checking so a release between the check and the
            // await still wakes us.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if self.try_take(&mut inner, agent_id, zone) {
                    inner.remove_waiter(zone, agent_id);
                    mark.active = false;
                    return AcquireOutcome::Acquired;
                }
            }

            tokio::select! {
                _ = &mut notified => continue,
                _ = cancel.cancelled() => {
                    flog!("zone", "{} stopped waiting for {}: cancelled", agent_id, zone);
                    return AcquireOutcome::Cancelled;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let mut inner = self.inner.lock();
                    if self.try_take(&mut inner, agent_id, zone) {
                        inner.remove_waiter(zone, agent_id);
                        mark.active = false;
                        return AcquireOutcome::Acquired;
                    }
                    drop(inner);
                    flog!("zone", "{} timed out waiting for {} after {:?}", agent_id, zone, timeout);
                    return AcquireOutcome::TimedOut;
                }
            }
        }
    }

    /// Acquire and wrap the hold in a guard that releases on drop.
    pub async fn guard(
        self: &Arc<Self>,
        agent_id: &str,
        zone: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ZoneGuard> {
        match self.acquire(agent_id, zone, timeout, cancel).await {
            AcquireOutcome::Acquired => Ok(ZoneGuard {
                lock: Arc::clone(self),
                agent_id: agent_id.to_string(),
                zone: zone.to_string(),
            }),
            AcquireOutcome::TimedOut => Err(Error::StepTimeout {
                step: format!("acquire zone {}", zone),
                timeout,
            }),
            AcquireOutcome::Cancelled => Err(Error::Cancelled(format!(
                "{} cancelled while waiting for zone {}",
                agent_id, zone
            ))),
        }
    }

    /// Give up one hold on `zone`.
    ///
    /// Returns `false` (and logs) when `agent_id` does not hold the zone.
    /// Unprotected zones are never held, so releasing one always succeeds.
    pub fn release(&self, agent_id: &str, zone: &str) -> bool {
        if !self.is_protected(zone) {
            return true;
        }
        let wake = {
            let mut inner = self.inner.lock();
            let Some(hold) = inner.holds.get_mut(zone) else {
                flog_error!(
                    "zone",
                    "{}",
                    Error::InternalInvariantViolation(format!(
                        "{} released {} which is not held",
                        agent_id, zone
                    ))
                );
                return false;
            };
            if hold.agent_id != agent_id {
                flog_error!(
                    "zone",
                    "{}",
                    Error::InternalInvariantViolation(format!(
                        "{} released {} held by {}",
                        agent_id, zone, hold.agent_id
                    ))
                );
                return false;
            }
            hold.depth -= 1;
            if hold.depth > 0 {
                flog_debug!("zone", "{} still holds {} (depth {})", agent_id, zone, hold.depth);
                return true;
            }
            inner.holds.remove(zone);

            let mut wake = vec![inner.notify_for(zone)];
            if let Some(partner) = self.partner(zone) {
                wake.push(inner.notify_for(partner));
            }
            wake
        };

        flog!("zone", "{} left {}", agent_id, zone);
        for notify in wake {
            notify.notify_waiters();
        }
        true
    }

    pub fn occupant(&self, zone: &str) -> Option<String> {
        self.inner.lock().holder(zone).map(str::to_string)
    }

    pub fn is_occupied(&self, zone: &str) -> bool {
        self.inner.lock().holds.contains_key(zone)
    }

    pub fn status(&self) -> ZoneStatus {
        let inner = self.inner.lock();
        ZoneStatus {
            occupied: inner
                .holds
                .iter()
                .map(|(zone, hold)| (zone.clone(), hold.agent_id.clone()))
                .collect(),
            waiting: inner
                .waiting
                .iter()
                .map(|(zone, agents)| (zone.clone(), agents.clone()))
                .collect(),
        }
    }

    fn try_take(&self, inner: &mut Inner, agent_id: &str, zone: &str) -> bool {
        if let Some(holder) = inner.holder(zone) {
            if holder != agent_id {
                return false;
            }
        }
        if let Some(partner) = self.partner(zone) {
            if let Some(holder) = inner.holder(partner) {
                if holder != agent_id {
                    return false;
                }
            }
        }

        let hold = inner.holds.entry(zone.to_string()).or_insert_with(|| Hold {
            agent_id: agent_id.to_string(),
            depth: 0,
        });
        hold.depth += 1;
        if hold.depth == 1 {
            flog!("zone", "{} entered {}", agent_id, zone);
        }
        true
    }

    fn blocking_holder(&self, agent_id: &str, zone: &str) -> Option<String> {
        let inner = self.inner.lock();
        let others = |z: &str| inner.holder(z).filter(|h| *h != agent_id).map(str::to_string);
        others(zone).or_else(|| self.partner(zone).and_then(others))
    }
}

/// Removes a waiter entry if `acquire` exits without taking the zone,
/// including when the future is dropped mid-wait.
struct WaitMark<'a> {
    lock: &'a ZoneLock,
    zone: &'a str,
    agent_id: &'a str,
    active: bool,
}

impl Drop for WaitMark<'_> {
    fn drop(&mut self) {
        if self.active {
            self.lock.inner.lock().remove_waiter(self.zone, self.agent_id);
        }
    }
}

/// A held zone, released when dropped.
pub struct ZoneGuard {
    lock: Arc<ZoneLock>,
    agent_id: String,
    zone: String,
}

impl ZoneGuard {
    pub fn zone(&self) -> &str {
        &self.zone
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Drop for ZoneGuard {
    fn drop(&mut self) {
        self.lock.release(&self.agent_id, &self.zone);
    }
}

impl std::fmt::Debug for ZoneGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZoneGuard")
            .field("agent_id", &self.agent_id)
            .field("zone", &self.zone)
            .finish()
    }
}
