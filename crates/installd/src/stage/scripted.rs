//! Scripted stage executor for tests and dry runs.

use async_trait::async_trait;
use installer_common::StageError;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

use super::{StageContext, StageExecutor, StageOutcome};

/// What one invocation of a [`ScriptedStage`] does.
#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(String),
    /// Succeed after a delay, unless cancelled first.
    SucceedAfter(Duration),
    /// Report each percentage, then succeed.
    Progress(Vec<u8>),
    /// Block until notified (then succeed) or cancelled.
    WaitFor(Arc<Notify>),
    /// Block until cancelled.
    WaitForCancel,
    /// Never return and never look at the cancel signal.
    IgnoreCancel,
}

/// Fake executor that plays back a queue of behaviors, one per call, then
/// repeats the fallback.
pub struct ScriptedStage {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    calls: AtomicU32,
    running: AtomicBool,
    overlapped: AtomicBool,
}

impl ScriptedStage {
    pub fn new(script: Vec<Behavior>, fallback: Behavior) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
            running: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(vec![], Behavior::Succeed)
    }

    /// Play `script`, then succeed on every later call.
    pub fn scripted(script: Vec<Behavior>) -> Self {
        Self::new(script, Behavior::Succeed)
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// True if two invocations ever ran at the same time.
    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_behavior(&self) -> Behavior {
        let mut script = match self.script.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        script.pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

/// Clears the running flag even when the task is aborted mid-call.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl StageExecutor for ScriptedStage {
    async fn execute(&self, ctx: StageContext) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.running.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        let _running = RunningGuard(&self.running);
        let mut cancel = ctx.cancel.clone();

        match self.next_behavior() {
            Behavior::Succeed => StageOutcome::Succeeded,
            Behavior::Fail(summary) => StageOutcome::Failed(
                StageError::new(summary).with_detail(format!("attempt {}", ctx.attempt)),
            ),
            Behavior::SucceedAfter(delay) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => StageOutcome::Succeeded,
                    _ = cancel.cancelled() => StageOutcome::Cancelled,
                }
            }
            Behavior::Progress(steps) => {
                for percent in steps {
                    ctx.progress
                        .report(Some(percent), Some(format!("{}%", percent)));
                }
                StageOutcome::Succeeded
            }
            Behavior::WaitFor(notify) => {
                tokio::select! {
                    _ = notify.notified() => StageOutcome::Succeeded,
                    _ = cancel.cancelled() => StageOutcome::Cancelled,
                }
            }
            Behavior::WaitForCancel => {
                cancel.cancelled().await;
                StageOutcome::Cancelled
            }
            Behavior::IgnoreCancel => {
                std::future::pending::<()>().await;
                StageOutcome::Succeeded
            }
        }
    }
}
