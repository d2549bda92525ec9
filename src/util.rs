//! Shared helpers for bounded, cancellable waits.

use std::future::Future;
use std::time::Duration;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Run `fut` with a hard timeout, aborting early if `cancel` fires.
///
/// `step` names the operation in the resulting error.
pub async fn bounded<F, T>(
    step: &str,
    duration: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled(format!("{} interrupted", step))),
        res = timeout(duration, fut) => match res {
            Ok(inner) => inner,
            Err(_) => Err(Error::StepTimeout {
                step: step.to_string(),
                timeout: duration,
            }),
        },
    }
}

/// Sleep for `duration`. Returns `false` if cancelled first.
pub async fn sleep_or_cancel(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Call `check` every `interval` until it yields a value or `deadline`
/// passes. The first check runs immediately.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    deadline: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> PollOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let until = tokio::time::Instant::now() + deadline;
    loop {
        if cancel.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        if let Some(value) = check().await {
            return PollOutcome::Ready(value);
        }
        let now = tokio::time::Instant::now();
        if now >= until {
            return PollOutcome::TimedOut;
        }
        let nap = interval.min(until - now);
        if !sleep_or_cancel(nap, cancel).await {
            return PollOutcome::Cancelled;
        }
    }
}
