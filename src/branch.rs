//! Parallel branches joined at a single barrier.
//!
//! Every branch is spawned before any is awaited. Branches share one child
//! cancellation token: the first failure cancels it so siblings stop at their
//! next suspension point. If the barrier times out, whatever is still running
//! is cancelled, aborted and reported as not completed.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::{flog, flog_debug, flog_warn, Error, Result};

type StartFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<()>> + Send>;

/// A branch waiting to be started with its group's token.
pub struct BranchTask {
    id: String,
    start: StartFn,
}

impl BranchTask {
    pub fn new<F, Fut>(id: &str, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: id.to_string(),
            start: Box::new(move |token| f(token).boxed()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchResult {
    pub branch_id: String,
    pub completed: bool,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinResult {
    pub branches: Vec<BranchResult>,
    pub timed_out: bool,
}

impl JoinResult {
    /// True only if every branch ran to completion and succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.branches.iter().all(|b| b.completed && b.success)
    }

    pub fn get(&self, branch_id: &str) -> Option<&BranchResult> {
        self.branches.iter().find(|b| b.branch_id == branch_id)
    }

    /// One line naming each branch that did not succeed.
    pub fn failure_summary(&self) -> Option<String> {
        let failed: Vec<String> = self
            .branches
            .iter()
            .filter(|b| !(b.completed && b.success))
            .map(|b| match (&b.error, b.completed) {
                (Some(err), _) => format!("{}: {}", b.branch_id, err),
                (None, false) => format!("{}: did not complete", b.branch_id),
                (None, true) => format!("{}: failed", b.branch_id),
            })
            .collect();
        (!failed.is_empty()).then(|| failed.join("; "))
    }
}

pub struct BranchRunner {
    group: CancellationToken,
}

impl BranchRunner {
    /// Branches run under a child of `parent`, so cancelling the task cancels
    /// them while a branch failure does not cancel the task.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            group: parent.child_token(),
        }
    }

    pub async fn run_parallel(self, branches: Vec<BranchTask>, join_timeout: Duration) -> JoinResult {
        let mut results: Vec<BranchResult> = branches
            .iter()
            .map(|b| BranchResult {
                branch_id: b.id.clone(),
                completed: false,
                success: false,
                error: None,
            })
            .collect();

        let mut set = JoinSet::new();
        for (idx, branch) in branches.into_iter().enumerate() {
            let fut = (branch.start)(self.group.clone());
            set.spawn(async move {
                let outcome = AssertUnwindSafe(fut).catch_unwind().await;
                let res = outcome.unwrap_or_else(|_| Err(Error::TaskJoin("branch panicked".to_string())));
                (idx, res)
            });
        }
        flog_debug!("branch", "started {} branch(es)", results.len());

        let deadline = tokio::time::sleep(join_timeout);
        tokio::pin!(deadline);
        let mut timed_out = false;

        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok((idx, res))) => {
                        let slot = &mut results[idx];
                        slot.completed = true;
                        match res {
                            Ok(()) => {
                                slot.success = true;
                                flog_debug!("branch", "{} finished", slot.branch_id);
                            }
                            Err(err) => {
                                flog_warn!("branch", "{} failed: {}", slot.branch_id, err);
                                slot.error = Some(err.to_string());
                                if !self.group.is_cancelled() {
                                    self.group.cancel();
                                }
                            }
                        }
                    }
                    // Only aborted tasks land here and abort happens after the loop.
                    Some(Err(join_err)) => {
                        flog_warn!("branch", "branch join error: {}", join_err);
                    }
                },
                _ = &mut deadline => {
                    timed_out = true;
                    break;
                }
            }
        }

        if timed_out {
            let pending: Vec<&str> = results
                .iter()
                .filter(|r| !r.completed)
                .map(|r| r.branch_id.as_str())
                .collect();
            flog_warn!(
                "branch",
                "join timed out after {:?}, cancelling: {}",
                join_timeout,
                pending.join(", ")
            );
            self.group.cancel();
            set.shutdown().await;
            for slot in results.iter_mut().filter(|r| !r.completed) {
                slot.error = Some(format!("did not complete within {:?}", join_timeout));
            }
        }

        let joined = JoinResult {
            branches: results,
            timed_out,
        };
        flog!(
            "branch",
            "barrier passed: {}",
            joined
                .branches
                .iter()
                .map(|b| format!("{}={}", b.branch_id, if b.success { "ok" } else { "failed" }))
                .collect::<Vec<_>>()
                .join(", ")
        );
        joined
    }

    /// Two-branch convenience returning each branch's success.
    pub async fn run_pair(self, a: BranchTask, b: BranchTask, join_timeout: Duration) -> (bool, bool) {
        let joined = self.run_parallel(vec![a, b], join_timeout).await;
        let ok = |idx: usize| {
            joined
                .branches
                .get(idx)
                .map(|r| r.completed && r.success)
                .unwrap_or(false)
        };
        (ok(0), ok(1))
    }
}
