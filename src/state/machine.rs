//! Per-task progress record and its shared handle.
//!
//! `StepState` is a plain value that enforces the transition rules:
//!
//! ```text
//! NotStarted -> Running -> { WaitingExternal <-> Running } -> Completed | Error | Cancelled
//! ```
//!
//! Terminal states reject every further mutation by returning `false`.
//! `StateHandle` shares one `StepState` between the single writer (the
//! task's execution) and any number of readers, which only ever receive
//! cloned snapshots.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::{flog, flog_debug, flog_error, flog_warn, Payload};

use super::step::{HistoryEntry, StepCode, StepDescriptor, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    pub current_step: StepDescriptor,
    pub history: Vec<HistoryEntry>,
    pub error_message: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub side_channel_payload: Option<Payload>,
    #[serde(skip)]
    started_at: Option<Instant>,
    #[serde(skip)]
    step_entered_at: Option<Instant>,
    #[serde(skip)]
    ended_at: Option<Instant>,
}

impl StepState {
    pub fn new(task_id: &str, agent_id: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            status: TaskStatus::NotStarted,
            current_step: StepDescriptor::default(),
            history: Vec::new(),
            error_message: None,
            start_time: None,
            end_time: None,
            side_channel_payload: None,
            started_at: None,
            step_entered_at: None,
            ended_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move from NotStarted to Running.
    pub fn begin(&mut self) -> bool {
        if self.status != TaskStatus::NotStarted {
            return false;
        }
        let now = Instant::now();
        self.status = TaskStatus::Running;
        self.start_time = Some(Utc::now());
        self.started_at = Some(now);
        self.step_entered_at = Some(now);
        true
    }

    /// Record entry into a new step.
    ///
    /// The step being left is appended to `history`. Wait-steps put the task
    /// into `WaitingExternal`, every other step into `Running`.
    pub fn update_step(&mut self, step: StepDescriptor) -> bool {
        if self.is_terminal() {
            return false;
        }
        if self.status == TaskStatus::NotStarted {
            self.begin();
        }
        self.push_current_to_history();
        self.status = if step.code.is_wait_step() {
            TaskStatus::WaitingExternal
        } else {
            TaskStatus::Running
        };
        self.current_step = step;
        self.step_entered_at = Some(Instant::now());
        true
    }

    pub fn set_error(&mut self, message: &str) -> bool {
        self.finish(
            TaskStatus::Error,
            StepDescriptor::new(StepCode::Error, message),
            Some(message.to_string()),
        )
    }

    /// Terminal completion; `success == false` ends the task in `Error`.
    pub fn complete(&mut self, success: bool, message: &str) -> bool {
        if success {
            self.finish(
                TaskStatus::Completed,
                StepDescriptor::new(StepCode::Completed, message),
                None,
            )
        } else {
            self.set_error(message)
        }
    }

    pub fn cancel(&mut self, message: &str) -> bool {
        self.finish(
            TaskStatus::Cancelled,
            StepDescriptor::new(StepCode::Cancelled, message),
            Some(message.to_string()),
        )
    }

    /// Merge an externally delivered payload into the side channel.
    pub fn deposit(&mut self, payload: &Payload) -> bool {
        if self.is_terminal() {
            return false;
        }
        let side = self.side_channel_payload.get_or_insert_with(Payload::new);
        for (key, value) in payload {
            side.insert(key.clone(), value.clone());
        }
        true
    }

    /// Wall time from start to end (or to now while still live).
    pub fn duration(&self) -> Option<Duration> {
        let started = self.started_at?;
        Some(match self.ended_at {
            Some(ended) => ended.duration_since(started),
            None => started.elapsed(),
        })
    }

    /// Time spent in the current step so far.
    pub fn current_step_elapsed(&self) -> Duration {
        self.step_entered_at
            .map(|t| t.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    fn finish(
        &mut self,
        status: TaskStatus,
        step: StepDescriptor,
        error_message: Option<String>,
    ) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.push_current_to_history();
        self.status = status;
        self.current_step = step;
        self.error_message = error_message;
        self.end_time = Some(Utc::now());
        self.ended_at = Some(Instant::now());
        true
    }

    fn push_current_to_history(&mut self) {
        if self.current_step.code == StepCode::Idle {
            return;
        }
        self.history.push(HistoryEntry {
            step: self.current_step.code,
            description: self.current_step.description.clone(),
            timestamp: Utc::now(),
            elapsed: self.current_step_elapsed(),
        });
    }
}

/// Shared, lock-protected handle to one task's `StepState`.
///
/// Every mutation publishes the new status on a watch channel so callers can
/// await terminal states without polling.
#[derive(Debug, Clone)]
pub struct StateHandle {
    inner: Arc<RwLock<StepState>>,
    status_tx: Arc<watch::Sender<TaskStatus>>,
}

impl StateHandle {
    pub fn new(task_id: &str, agent_id: &str) -> Self {
        let (status_tx, _) = watch::channel(TaskStatus::NotStarted);
        Self {
            inner: Arc::new(RwLock::new(StepState::new(task_id, agent_id))),
            status_tx: Arc::new(status_tx),
        }
    }

    pub fn task_id(&self) -> String {
        self.inner.read().task_id.clone()
    }

    pub fn agent_id(&self) -> String {
        self.inner.read().agent_id.clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.inner.read().status
    }

    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    /// Deep point-in-time copy.
    pub fn snapshot(&self) -> StepState {
        self.inner.read().clone()
    }

    pub fn begin(&self) -> bool {
        self.mutate(|s| s.begin())
    }

    pub fn update_step(&self, step: StepDescriptor) -> bool {
        let label = format!("{} - {}", step.code, step.description);
        let accepted = self.mutate(|s| s.update_step(step));
        if accepted {
            flog!("task", "[{}] step: {}", self.task_id(), label);
        } else {
            flog_warn!(
                "task",
                "[{}] rejected step update after terminal state: {}",
                self.task_id(),
                label
            );
        }
        accepted
    }

    pub fn set_error(&self, message: &str) -> bool {
        let accepted = self.mutate(|s| s.set_error(message));
        if accepted {
            flog_error!("task", "[{}] error: {}", self.task_id(), message);
        }
        accepted
    }

    pub fn complete(&self, success: bool, message: &str) -> bool {
        let accepted = self.mutate(|s| s.complete(success, message));
        if accepted {
            flog!(
                "task",
                "[{}] complete: success={}, message={}",
                self.task_id(),
                success,
                message
            );
        }
        accepted
    }

    pub fn cancel(&self, message: &str) -> bool {
        let accepted = self.mutate(|s| s.cancel(message));
        if accepted {
            flog!("task", "[{}] cancelled: {}", self.task_id(), message);
        }
        accepted
    }

    pub fn deposit(&self, payload: &Payload) -> bool {
        let accepted = self.mutate(|s| s.deposit(payload));
        flog_debug!(
            "task",
            "[{}] deposit {} key(s), accepted={}",
            self.task_id(),
            payload.len(),
            accepted
        );
        accepted
    }

    pub fn subscribe(&self) -> watch::Receiver<TaskStatus> {
        self.status_tx.subscribe()
    }

    /// Resolve once the task reaches a terminal status.
    pub async fn wait_terminal(&self) -> TaskStatus {
        let mut rx = self.subscribe();
        let current = self.status();
        if current.is_terminal() {
            return current;
        }
        let result = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(status) => *status,
            // Sender lives as long as self, so this branch is unreachable in
            // practice; fall back to the stored status.
            Err(_) => self.status(),
        };
        result
    }

    fn mutate(&self, f: impl FnOnce(&mut StepState) -> bool) -> bool {
        let mut state = self.inner.write();
        let accepted = f(&mut state);
        if accepted {
            self.status_tx.send_replace(state.status);
        }
        accepted
    }
}
