//! Step vocabulary and status types for task progress tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every kind of step a workflow can be in.
///
/// This is a closed set so that each transition is checked at compile
/// time rather than compared as strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepCode {
    Idle,
    Navigating,
    GrabbingScanGun,
    CvDetecting,
    Grabbing,
    Scanning,
    WaitingIdInput,
    PuttingToBack,
    TurningBackFront,
    PuttingDown,
    Pouring,
    OpeningLid,
    ClosingLid,
    Cleaning,
    Detecting,
    TransferringTube,
    WaitingDevice,
    EnteringZone,
    Parallel,
    Completed,
    Error,
    Cancelled,
}

impl StepCode {
    /// Steps during which the task is parked on an external signal.
    pub fn is_wait_step(&self) -> bool {
        matches!(self, StepCode::WaitingIdInput | StepCode::WaitingDevice)
    }

    /// Default human-readable label for the step.
    pub fn label(&self) -> &'static str {
        match self {
            StepCode::Idle => "idle",
            StepCode::Navigating => "navigating",
            StepCode::GrabbingScanGun => "grabbing scan gun",
            StepCode::CvDetecting => "detecting bottles",
            StepCode::Grabbing => "grabbing bottle",
            StepCode::Scanning => "scanning qr code",
            StepCode::WaitingIdInput => "waiting for id input",
            StepCode::PuttingToBack => "putting to back platform",
            StepCode::TurningBackFront => "turning back to front",
            StepCode::PuttingDown => "putting down bottle",
            StepCode::Pouring => "pouring liquid",
            StepCode::OpeningLid => "opening lid",
            StepCode::ClosingLid => "closing lid",
            StepCode::Cleaning => "cleaning tube",
            StepCode::Detecting => "running detection",
            StepCode::TransferringTube => "transferring tube",
            StepCode::WaitingDevice => "waiting for device",
            StepCode::EnteringZone => "entering zone",
            StepCode::Parallel => "parallel block",
            StepCode::Completed => "completed",
            StepCode::Error => "error",
            StepCode::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StepCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// The step a task is currently in, with a free-form description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDescriptor {
    pub code: StepCode,
    pub description: String,
}

impl StepDescriptor {
    pub fn new(code: StepCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Descriptor using the code's default label.
    pub fn of(code: StepCode) -> Self {
        Self::new(code, code.label())
    }
}

impl Default for StepDescriptor {
    fn default() -> Self {
        Self::of(StepCode::Idle)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    NotStarted,
    Running,
    WaitingExternal,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::NotStarted => write!(f, "not_started"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::WaitingExternal => write!(f, "waiting_external"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A step the task has left, in the order it was left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub step: StepCode,
    pub description: String,
    /// When the step was left.
    pub timestamp: DateTime<Utc>,
    /// Time spent in the step.
    pub elapsed: Duration,
}
