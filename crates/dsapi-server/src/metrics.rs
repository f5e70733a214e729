use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use dsapi_engine::auditlog::audit_totals;
use dsapi_engine::rollback::rollback_totals;
use dsapi_engine::ErrorKind;

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    /// Creates a zero counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Current value.
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters of the HTTP surface.
#[derive(Debug, Default)]
pub struct ApiMetrics {
    /// Responses by status class (`2xx`, `4xx`, ...)
    pub requests: DashMap<&'static str, u64>,
    /// Error responses by taxonomy kind
    pub errors: DashMap<&'static str, u64>,
    /// Datasets created
    pub datasets_created: Counter,
    /// Datasets deleted
    pub datasets_deleted: Counter,
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

impl ApiMetrics {
    /// Creates empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts a response.
    pub fn record_status(&self, status: u16) {
        *self.requests.entry(status_class(status)).or_insert(0) += 1;
    }

    /// Counts an error by kind.
    pub fn record_error(&self, kind: ErrorKind) {
        *self.errors.entry(kind.as_str()).or_insert(0) += 1;
    }

    /// Prometheus text exposition of the API and engine counters.
    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# TYPE dsapi_requests_total counter\n");
        let mut requests: Vec<_> = self.requests.iter().map(|e| (*e.key(), *e.value())).collect();
        requests.sort();
        for (class, count) in requests {
            output.push_str(&format!("dsapi_requests_total{{class=\"{}\"}} {}\n", class, count));
        }

        output.push_str("# TYPE dsapi_errors_total counter\n");
        let mut errors: Vec<_> = self.errors.iter().map(|e| (*e.key(), *e.value())).collect();
        errors.sort();
        for (kind, count) in errors {
            output.push_str(&format!("dsapi_errors_total{{kind=\"{}\"}} {}\n", kind, count));
        }

        output.push_str("# TYPE dsapi_datasets_created_total counter\n");
        output.push_str(&format!("dsapi_datasets_created_total {}\n", self.datasets_created.get()));
        output.push_str("# TYPE dsapi_datasets_deleted_total counter\n");
        output.push_str(&format!("dsapi_datasets_deleted_total {}\n", self.datasets_deleted.get()));

        let rollbacks = rollback_totals();
        output.push_str("# TYPE dsapi_rollbacks_total counter\n");
        output.push_str(&format!("dsapi_rollbacks_total {}\n", rollbacks.rollbacks));
        output.push_str("# TYPE dsapi_compensator_failures_total counter\n");
        output.push_str(&format!(
            "dsapi_compensator_failures_total {}\n",
            rollbacks.compensator_failures
        ));

        let audit = audit_totals();
        output.push_str("# TYPE dsapi_audit_events_flushed_total counter\n");
        output.push_str(&format!("dsapi_audit_events_flushed_total {}\n", audit.flushed));
        output.push_str("# TYPE dsapi_audit_events_failed_total counter\n");
        output.push_str(&format!("dsapi_audit_events_failed_total {}\n", audit.failed));

        output
    }
}
