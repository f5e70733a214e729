//! Audit log pipe.
//!
//! [`CloudAuditLog::log`] hands out the sending half of a channel and spawns a
//! task owning the receiving half. The task stamps each event with its receipt
//! time and buffers it; the buffer is written to the log service when the
//! channel has been quiet for the flush timeout, when the request is
//! cancelled, or when every sender is dropped. The last two also end the task.
//! Write failures are logged and counted, never returned to the producer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cloud::{LogEvent, LogService, Tag};
use crate::context::RequestContext;
use crate::error::{DsError, Result};
use crate::repository::AuditLogRepository;
use crate::rollback::Rollback;

/// Inactivity flush timeout used when none is configured.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(600);

/// Bound on the final flush after the pipe closes.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

const CHANNEL_CAPACITY: usize = 256;

static EVENTS_FLUSHED: AtomicU64 = AtomicU64::new(0);
static EVENTS_FAILED: AtomicU64 = AtomicU64::new(0);

/// Process-wide audit pipe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditTotals {
    /// Events written to the log service
    pub flushed: u64,
    /// Events lost to write failures
    pub failed: u64,
}

/// Current audit pipe counters.
pub fn audit_totals() -> AuditTotals {
    AuditTotals {
        flushed: EVENTS_FLUSHED.load(Ordering::Relaxed),
        failed: EVENTS_FAILED.load(Ordering::Relaxed),
    }
}

/// What an audit record reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    /// Dataset provisioned and recorded
    DatasetCreate,
    /// Dataset description changed
    DatasetUpdate,
    /// Dataset finalized
    DatasetPromote,
    /// Dataset removed
    DatasetDelete,
    /// Attachment stored
    AttachmentCreate,
    /// Attachment removed
    AttachmentDelete,
    /// Instance bound to the dataset
    AccessGrant,
    /// Instance unbound from the dataset
    AccessRevoke,
    /// Temporary user created
    UserCreate,
    /// Temporary user keys rotated
    UserUpdate,
    /// Temporary user removed
    UserDelete,
}

/// One audit event, written to the stream as a JSON line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Action performed
    pub action: AuditAction,
    /// Dataset id
    pub dataset: String,
    /// Request id of the originating call
    pub request_id: String,
    /// Action-specific detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl AuditRecord {
    /// Creates a record for `dataset` originating from `ctx`.
    pub fn new(ctx: &RequestContext, action: AuditAction, dataset: &str, detail: impl Into<String>) -> Self {
        Self {
            action,
            dataset: dataset.to_string(),
            request_id: ctx.request_id().to_string(),
            detail: detail.into(),
        }
    }

    /// The line written to the stream.
    pub fn to_message(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?} {}", self.action, self.dataset))
    }
}

/// Audit log repository writing to a [`LogService`].
pub struct CloudAuditLog {
    logs: Arc<dyn LogService>,
    flush_timeout: Duration,
}

impl CloudAuditLog {
    /// Creates a repository flushing after `flush_timeout` of inactivity.
    pub fn new(logs: Arc<dyn LogService>, flush_timeout: Duration) -> Self {
        Self { logs, flush_timeout }
    }

    async fn create_log_steps(
        &self,
        ctx: &RequestContext,
        rollback: &mut Rollback,
        group: &str,
        stream: &str,
        retention_days: u32,
        tags: &[Tag],
    ) -> Result<()> {
        match ctx.call(self.logs.create_log_group(group, tags)).await {
            Ok(()) => {
                let logs = Arc::clone(&self.logs);
                let name = group.to_string();
                rollback.push(format!("delete log group {}", group), move |ctx| async move {
                    ctx.call(logs.delete_log_group(&name)).await
                });
                debug!(group, "log group created");
            }
            Err(DsError::Conflict(_)) => debug!(group, "log group already exists"),
            Err(e) => return Err(e),
        }

        ctx.call(self.logs.put_retention_policy(group, retention_days)).await?;

        match ctx.call(self.logs.create_log_stream(group, stream)).await {
            Ok(()) | Err(DsError::Conflict(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl AuditLogRepository for CloudAuditLog {
    async fn create_log(&self, ctx: &RequestContext, group: &str, stream: &str, retention_days: u32, tags: &[Tag]) -> Result<()> {
        let mut rollback = Rollback::new(ctx);
        let result = self
            .create_log_steps(ctx, &mut rollback, group, stream, retention_days, tags)
            .await;
        rollback.finish(result).await
    }

    fn log(&self, ctx: &RequestContext, group: &str, stream: &str) -> Result<mpsc::Sender<String>> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|e| DsError::Internal(format!("audit pipe needs a runtime: {}", e)))?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pipe = Pipe {
            logs: Arc::clone(&self.logs),
            group: group.to_string(),
            stream: stream.to_string(),
            writer: ctx.detached(),
            flush_timeout: self.flush_timeout,
        };
        handle.spawn(pipe.run(rx, ctx.token().clone()));
        Ok(tx)
    }

    async fn events(&self, ctx: &RequestContext, group: &str, stream: &str) -> Result<Vec<LogEvent>> {
        ctx.call(self.logs.get_log_events(group, stream)).await
    }
}

struct Pipe {
    logs: Arc<dyn LogService>,
    group: String,
    stream: String,
    writer: RequestContext,
    flush_timeout: Duration,
}

impl Pipe {
    async fn run(self, mut rx: mpsc::Receiver<String>, cancel: CancellationToken) {
        let mut batch = Vec::new();
        loop {
            tokio::select! {
                biased;
                msg = rx.recv() => match msg {
                    Some(message) => batch.push(LogEvent {
                        timestamp: Utc::now().timestamp_millis(),
                        message,
                    }),
                    None => break,
                },
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.flush_timeout) => self.flush(&mut batch).await,
            }
        }

        rx.close();
        while let Ok(message) = rx.try_recv() {
            batch.push(LogEvent {
                timestamp: Utc::now().timestamp_millis(),
                message,
            });
        }
        let pending = batch.len() as u64;
        if tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.flush(&mut batch)).await.is_err() {
            EVENTS_FAILED.fetch_add(pending, Ordering::Relaxed);
            warn!(group = %self.group, stream = %self.stream, events = pending, "audit flush timed out on close");
        }
        debug!(group = %self.group, stream = %self.stream, "audit pipe closed");
    }

    async fn flush(&self, batch: &mut Vec<LogEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        let count = events.len() as u64;
        match self
            .writer
            .call(self.logs.put_log_events(&self.group, &self.stream, events))
            .await
        {
            Ok(()) => {
                EVENTS_FLUSHED.fetch_add(count, Ordering::Relaxed);
                debug!(group = %self.group, stream = %self.stream, events = count, "audit events flushed");
            }
            Err(e) => {
                EVENTS_FAILED.fetch_add(count, Ordering::Relaxed);
                warn!(group = %self.group, stream = %self.stream, events = count, error = %e, "audit write failed");
            }
        }
    }
}
