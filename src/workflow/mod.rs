//! Workflow definitions.
//!
//! `types` is the step model the executor runs; `catalog` holds the named
//! workflows built from it.

pub mod catalog;
mod types;

pub use catalog::{
    WorkflowInfo, CLOSE_LID_DONE_SIGNAL, NAVIGATION_DONE, NAVIGATION_FAILED, NAVIGATION_TOPIC,
    SCAN_ENTER_ID_SIGNAL, WORKFLOWS,
};
pub use types::{
    new_task_id, ActionStep, Branch, ParallelStep, PollStep, Step, WaitStep, ZoneStep, ZonedStep,
};
pub(crate) use types::millis;
