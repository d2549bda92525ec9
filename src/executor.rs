//! Runs a step list for one task.
//!
//! Each step records its descriptor on the task's `StepState`, then performs
//! the work with every suspension point bounded by a timeout and tied to the
//! task's cancellation token. The first failure stops the list. Zone guards
//! and pending gates are scoped to the step that took them, so they are
//! released on every exit path.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::actuator::{ActuatorCall, ActuatorClient};
use crate::branch::{BranchRunner, BranchTask};
use crate::config::Timeouts;
use crate::gate::{GateOutcome, GateTable};
use crate::state::{StateHandle, StepDescriptor};
use crate::util::{bounded, poll_until, PollOutcome};
use crate::workflow::{
    millis, ActionStep, ParallelStep, PollStep, Step, WaitStep, ZoneStep, ZonedStep,
};
use crate::zone::ZoneLock;
use crate::{flog, flog_debug, flog_error, Error, Payload, Result};

pub type Actuators = HashMap<String, Arc<dyn ActuatorClient>>;

/// Everything a running step needs. Cheap to clone; branches get a clone
/// with their own label and cancellation token.
#[derive(Clone)]
pub struct StepContext {
    pub agent_id: String,
    pub state: StateHandle,
    pub cancel: CancellationToken,
    pub actuators: Arc<Actuators>,
    pub zones: Arc<ZoneLock>,
    pub gates: Arc<GateTable>,
    pub timeouts: Timeouts,
    branch: Option<String>,
}

impl StepContext {
    pub fn new(
        agent_id: &str,
        state: StateHandle,
        cancel: CancellationToken,
        actuators: Arc<Actuators>,
        zones: Arc<ZoneLock>,
        gates: Arc<GateTable>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state,
            cancel,
            actuators,
            zones,
            gates,
            timeouts,
            branch: None,
        }
    }

    fn for_branch(&self, branch_id: &str, cancel: CancellationToken) -> Self {
        let label = match &self.branch {
            Some(parent) => format!("{}/{}", parent, branch_id),
            None => branch_id.to_string(),
        };
        Self {
            cancel,
            branch: Some(label),
            ..self.clone()
        }
    }

    fn actuator(&self, agent_id: &str) -> Result<Arc<dyn ActuatorClient>> {
        self.actuators
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::UnknownAgent(agent_id.to_string()))
    }

    fn resolve<'a>(&'a self, agent: &'a Option<String>) -> &'a str {
        agent.as_deref().unwrap_or(&self.agent_id)
    }

    /// Record entry into a step. Fails if the task already ended.
    fn enter(&self, descriptor: StepDescriptor) -> Result<()> {
        let descriptor = match &self.branch {
            Some(label) => StepDescriptor::new(
                descriptor.code,
                format!("[{}] {}", label, descriptor.description),
            ),
            None => descriptor,
        };
        if self.state.update_step(descriptor) {
            Ok(())
        } else {
            Err(Error::Cancelled(format!(
                "task {} already finished",
                self.state.task_id()
            )))
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled(format!(
                "task {} cancelled",
                self.state.task_id()
            )));
        }
        Ok(())
    }
}

/// Run a task's steps to a terminal state.
///
/// Exactly one of `complete`, `set_error` or `cancel` is applied to the state
/// at the end.
pub async fn run_task(ctx: StepContext, steps: Vec<Step>) {
    let task_id = ctx.state.task_id();
    ctx.state.begin();
    flog!(
        "task",
        "[{}] started on {} with {} step(s)",
        task_id,
        ctx.agent_id,
        steps.len()
    );

    let result = run_steps(ctx.clone(), steps).await;
    match result {
        Ok(()) => {
            ctx.state.complete(true, "workflow completed");
        }
        Err(err) if ctx.cancel.is_cancelled() || matches!(err, Error::Cancelled(_)) => {
            ctx.state.cancel(&err.to_string());
        }
        Err(err) => {
            flog_error!("task", "[{}] failed ({}): {}", task_id, err.kind(), err);
            ctx.state.set_error(&err.to_string());
        }
    }
}

/// Run steps in order, stopping at the first failure.
pub fn run_steps(ctx: StepContext, steps: Vec<Step>) -> BoxFuture<'static, Result<()>> {
    async move {
        for step in steps {
            ctx.check_cancelled()?;
            run_step(&ctx, step).await?;
        }
        Ok(())
    }
    .boxed()
}

async fn run_step(ctx: &StepContext, step: Step) -> Result<()> {
    match step {
        Step::Call(call) => {
            ctx.enter(StepDescriptor::new(call.code, &call.description))?;
            let reply = call_actuator(ctx, &call).await?;
            keep_reply(ctx, &call.action, reply);
            Ok(())
        }
        Step::ZoneCall(zone_step) => run_zone_call(ctx, zone_step).await,
        Step::Zoned(block) => run_zoned(ctx, block).await,
        Step::WaitSignal(wait) => run_wait(ctx, wait).await,
        Step::Poll(poll) => run_poll(ctx, poll).await,
        Step::Parallel(parallel) => run_parallel(ctx, parallel).await,
    }
}

async fn call_actuator(ctx: &StepContext, step: &ActionStep) -> Result<Payload> {
    let agent = ctx.resolve(&step.agent);
    let client = ctx.actuator(agent)?;
    let call = ActuatorCall::new(agent, &step.service, &step.action).with_args(step.args.clone());
    let timeout = millis(step.timeout_ms, ctx.timeouts.actuator());

    flog_debug!("task", "{} -> {}::{}", agent, step.service, step.action);
    let reply = bounded(&step.action, timeout, &ctx.cancel, client.call(&call)).await?;
    if !reply.ok {
        return Err(Error::StepFailed {
            step: step.action.clone(),
            reason: reply
                .message()
                .unwrap_or("controller reported failure")
                .to_string(),
        });
    }
    Ok(reply.payload)
}

/// Store a non-empty controller reply on the task, keyed by action name.
fn keep_reply(ctx: &StepContext, action: &str, reply: Payload) {
    if reply.is_empty() {
        return;
    }
    let mut entry = Payload::new();
    entry.insert(action.to_string(), Value::Object(reply));
    ctx.state.deposit(&entry);
}

async fn run_zone_call(ctx: &StepContext, step: ZoneStep) -> Result<()> {
    ctx.enter(Step::ZoneCall(step.clone()).descriptor())?;
    let agent = ctx.resolve(&step.call.agent);
    let _guard = ctx
        .zones
        .guard(agent, &step.zone, ctx.timeouts.zone(), &ctx.cancel)
        .await?;
    let reply = call_actuator(ctx, &step.call).await?;
    keep_reply(ctx, &step.call.action, reply);
    Ok(())
}

async fn run_zoned(ctx: &StepContext, block: ZonedStep) -> Result<()> {
    ctx.enter(Step::Zoned(block.clone()).descriptor())?;
    let agent = ctx.resolve(&block.agent);
    let _guard = ctx
        .zones
        .guard(agent, &block.zone, ctx.timeouts.zone(), &ctx.cancel)
        .await?;
    flog_debug!("task", "{} holding {} for {} step(s)", agent, block.zone, block.steps.len());
    run_steps(ctx.clone(), block.steps).await
}

async fn run_wait(ctx: &StepContext, step: WaitStep) -> Result<()> {
    let agent = ctx.resolve(&step.agent);
    // Armed before the state shows WaitingExternal, so a signal sent in
    // response to that status always finds the gate.
    let gate = ctx
        .gates
        .arm_with(&step.signal, agent, &step.required_fields)?;
    ctx.enter(StepDescriptor::new(step.code, &step.description))?;

    let timeout = millis(step.timeout_ms, ctx.timeouts.gate());
    match gate.wait(timeout, &ctx.cancel).await {
        GateOutcome::Fulfilled(payload) => {
            ctx.state.deposit(&payload);
            Ok(())
        }
        GateOutcome::TimedOut => Err(Error::StepTimeout {
            step: format!("waiting for {}", step.signal),
            timeout,
        }),
        GateOutcome::Cancelled => Err(Error::Cancelled(format!(
            "wait for {} interrupted",
            step.signal
        ))),
    }
}

fn read_code(message: &Payload, pointer: &str) -> Option<i64> {
    let path = pointer.strip_prefix('/')?;
    let mut segments = path.split('/');
    let first = segments.next()?;
    let mut value = message.get(first)?;
    for segment in segments {
        value = match value {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    value.as_i64()
}

async fn run_poll(ctx: &StepContext, step: PollStep) -> Result<()> {
    ctx.enter(StepDescriptor::new(step.code, &step.description))?;
    let agent = ctx.resolve(&step.agent);
    let client = ctx.actuator(agent)?;
    let interval = millis(step.interval_ms, ctx.timeouts.poll_interval());
    let deadline = millis(step.deadline_ms, ctx.timeouts.poll_deadline());

    let client_ref = client.as_ref();
    let topic = step.topic.as_str();
    let pointer = step.pointer.as_str();
    let (done, failed) = (step.done.as_slice(), step.failed.as_slice());

    let outcome = poll_until(interval, deadline, &ctx.cancel, move || async move {
        let message = client_ref.peek(topic).await?;
        let code = read_code(&message, pointer)?;
        (done.contains(&code) || failed.contains(&code)).then_some(code)
    })
    .await;

    match outcome {
        PollOutcome::Ready(code) if failed.contains(&code) => Err(Error::StepFailed {
            step: step.description.clone(),
            reason: format!("{} reported status {}", step.topic, code),
        }),
        PollOutcome::Ready(code) => {
            flog_debug!("task", "{} reached status {} on {}", agent, code, step.topic);
            Ok(())
        }
        PollOutcome::TimedOut => Err(Error::StepTimeout {
            step: step.description.clone(),
            timeout: deadline,
        }),
        PollOutcome::Cancelled => Err(Error::Cancelled(format!(
            "polling {} interrupted",
            step.topic
        ))),
    }
}

async fn run_parallel(ctx: &StepContext, step: ParallelStep) -> Result<()> {
    ctx.enter(Step::Parallel(step.clone()).descriptor())?;
    let join_timeout = millis(step.join_timeout_ms, ctx.timeouts.join());

    let tasks: Vec<BranchTask> = step
        .branches
        .into_iter()
        .map(|branch| {
            let parent = ctx.clone();
            BranchTask::new(&branch.id.clone(), move |token| {
                run_steps(parent.for_branch(&branch.id, token), branch.steps)
            })
        })
        .collect();

    let joined = BranchRunner::new(&ctx.cancel)
        .run_parallel(tasks, join_timeout)
        .await;

    ctx.check_cancelled()?;
    if joined.all_succeeded() {
        return Ok(());
    }
    let reason = joined
        .failure_summary()
        .unwrap_or_else(|| "branch failed".to_string());
    if joined.timed_out {
        return Err(Error::StepTimeout {
            step: format!("parallel block ({})", reason),
            timeout: join_timeout,
        });
    }
    Err(Error::StepFailed {
        step: "parallel block".to_string(),
        reason,
    })
}
