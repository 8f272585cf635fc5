//! Per-call context: cancellation, deadline, and the approval flag.
//!
//! Every protocol-facing operation takes a `CallContext`. Derived contexts
//! share the parent's cancellation and can only tighten its deadline.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::errors::McpError;

/// Cancellable, deadline-bearing context for one call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
    approved: bool,
}

impl CallContext {
    /// A fresh context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context driven by an externally owned token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
            approved: false,
        }
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a context with `deadline`, keeping the earlier of the two.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        Self {
            cancel: self.cancel.child_token(),
            deadline: Some(deadline),
            approved: self.approved,
        }
    }

    /// Mark the call as approved by a human or policy.
    pub fn approve(mut self) -> Self {
        self.approved = true;
        self
    }

    pub fn is_approved(&self) -> bool {
        self.approved
    }

    /// Cancel this context and every context derived from it.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it completes, the context is cancelled, or the
    /// deadline passes. `target` names the callee in timeout errors.
    pub async fn run<F, T>(&self, target: &str, fut: F) -> Result<T, McpError>
    where
        F: Future<Output = Result<T, McpError>>,
    {
        if self.is_cancelled() {
            return Err(McpError::Cancelled);
        }

        let deadline = self.deadline;
        let timeout_ms = self
            .remaining()
            .map(duration_millis)
            .unwrap_or_default();

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(McpError::Cancelled),
            _ = sleep_until_opt(deadline) => Err(McpError::Timeout {
                target: target.to_string(),
                timeout_ms,
            }),
            result = fut => result,
        }
    }

    /// Sleep for `delay`, waking early with `Cancelled` if the context is
    /// cancelled. A deadline that falls inside the delay ends it with `Timeout`.
    pub async fn sleep(&self, delay: Duration) -> Result<(), McpError> {
        self.run("backoff", async {
            tokio::time::sleep(delay).await;
            Ok(())
        })
        .await
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

// ─── Background Loops ────────────────────────────────────────────────────────

/// A spawned loop paired with the token that stops it.
#[derive(Debug)]
pub struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `body`, handing it the token it must watch.
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(body(cancel.clone()));
        Self { cancel, handle }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the loop and wait for it to exit.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::warn!(error = %e, "background task panicked");
            }
        }
    }
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn duration_millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
