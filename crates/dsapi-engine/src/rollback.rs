//! LIFO ledger of compensating actions for multi-step protocols.
//!
//! Each step of a protocol pushes the action that undoes it *before* the next
//! step is attempted. If the protocol fails, [`Rollback::finish`] drains the
//! ledger newest-first. A compensator that fails is logged and skipped; the
//! rest still run.
//!
//! A ledger dropped while still armed (the request future was cancelled or a
//! step panicked) hands its pending compensators to a background task.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::context::RequestContext;
use crate::error::Result;

/// Boxed future returned by a compensator.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

static ROLLBACKS: AtomicU64 = AtomicU64::new(0);
static COMPENSATOR_FAILURES: AtomicU64 = AtomicU64::new(0);

/// Process-wide rollback counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackTotals {
    /// Ledgers drained with at least one compensator
    pub rollbacks: u64,
    /// Compensators that returned an error
    pub compensator_failures: u64,
}

/// Current rollback counters.
pub fn rollback_totals() -> RollbackTotals {
    RollbackTotals {
        rollbacks: ROLLBACKS.load(Ordering::Relaxed),
        compensator_failures: COMPENSATOR_FAILURES.load(Ordering::Relaxed),
    }
}

type Compensator = Box<dyn FnOnce(RequestContext) -> BoxFuture<'static, Result<()>> + Send>;

struct Entry {
    name: String,
    action: Compensator,
}

/// Outcome of draining a ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Compensators that ran.
    pub ran: usize,
    /// Compensators that returned an error.
    pub failed: usize,
}

/// Per-operation stack of compensators.
pub struct Rollback {
    entries: Vec<Entry>,
    ctx: RequestContext,
}

impl Rollback {
    /// Creates an empty ledger.
    ///
    /// Compensators run under a context detached from `ctx`: undoing work must
    /// not be short-circuited by the cancellation that caused the failure.
    pub fn new(ctx: &RequestContext) -> Self {
        Self {
            entries: Vec::new(),
            ctx: ctx.detached(),
        }
    }

    /// Appends a compensator.
    pub fn push<F, Fut>(&mut self, name: impl Into<String>, action: F)
    where
        F: FnOnce(RequestContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        debug!(compensator = %name, "rollback: registered");
        self.entries.push(Entry {
            name,
            action: Box::new(move |ctx| Box::pin(action(ctx))),
        });
    }

    /// Number of pending compensators.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Names of pending compensators, oldest first.
    pub fn pending(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Forgets every compensator (the protocol committed).
    pub fn disarm(&mut self) {
        self.entries.clear();
    }

    /// Runs every compensator in reverse insertion order.
    pub async fn execute(&mut self) -> RollbackReport {
        let entries = std::mem::take(&mut self.entries);
        run_entries(entries, self.ctx.clone()).await
    }

    /// Settles a protocol: disarms on success, rolls back on failure.
    pub async fn finish<T>(mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(v) => {
                self.disarm();
                Ok(v)
            }
            Err(e) => {
                warn!(error = %e, steps = self.entries.len(), "rollback: protocol failed, compensating");
                self.execute().await;
                Err(e)
            }
        }
    }
}

async fn run_entries(entries: Vec<Entry>, ctx: RequestContext) -> RollbackReport {
    let mut report = RollbackReport::default();
    if !entries.is_empty() {
        ROLLBACKS.fetch_add(1, Ordering::Relaxed);
    }
    for entry in entries.into_iter().rev() {
        report.ran += 1;
        debug!(compensator = %entry.name, "rollback: executing");
        if let Err(e) = (entry.action)(ctx.clone()).await {
            report.failed += 1;
            COMPENSATOR_FAILURES.fetch_add(1, Ordering::Relaxed);
            warn!(compensator = %entry.name, error = %e, "rollback: compensator failed, continuing");
        }
    }
    report
}

impl Drop for Rollback {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }
        let entries = std::mem::take(&mut self.entries);
        let ctx = self.ctx.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(steps = entries.len(), "rollback: ledger dropped while armed, compensating in background");
                handle.spawn(async move {
                    run_entries(entries, ctx).await;
                });
            }
            Err(_) => {
                warn!(steps = entries.len(), "rollback: ledger dropped outside a runtime, compensators lost");
            }
        }
    }
}
