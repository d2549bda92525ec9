//! Task progress tracking.
//!
//! `step` holds the vocabulary, `machine` the per-task state machine and its
//! shared handle, `registry` the one-slot-per-agent table of tracked tasks.

mod machine;
mod registry;
mod step;

pub use machine::{StateHandle, StepState};
pub use registry::{TaskQuery, TaskRegistry, TaskSlot};
pub use step::{HistoryEntry, StepCode, StepDescriptor, TaskStatus};
