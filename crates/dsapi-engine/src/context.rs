//! Per-request cancellation scope.
//!
//! Every backend call made by the engine goes through [`RequestContext::call`],
//! which races the call against the request's cancellation token and passes
//! backend failures through the classifier.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{classify, CloudError, DsError, Result};

/// Cancellation handle and identity of a single request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    cancel: CancellationToken,
    request_id: String,
}

impl RequestContext {
    /// Creates a root context with a fresh request id.
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Creates a context bound to an existing token.
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            request_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// A context cancelled together with this one, but cancellable on its own.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            request_id: self.request_id.clone(),
        }
    }

    /// A fresh, uncancelled context carrying the same request id.
    pub fn detached(&self) -> Self {
        Self {
            cancel: CancellationToken::new(),
            request_id: self.request_id.clone(),
        }
    }

    /// Request id used in log fields.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// The underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cancels this context and all of its children.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the request has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs a backend call, classifying its error and aborting on cancellation.
    pub async fn call<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, CloudError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(DsError::Cancelled);
        }
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DsError::Cancelled),
            res = fut => res.map_err(|e| classify(&e)),
        }
    }

    /// Sleeps for `delay`, returning early with `Cancelled` if the request goes away.
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DsError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
