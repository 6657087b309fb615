//! Metrics recorder seam.
//!
//! The crate emits a small set of billing events through a process-wide
//! recorder. Deployments plug in their metrics backend by installing a
//! recorder at startup; the default discards everything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::core::types::Quota;

/// Billing events the core reports.
pub trait MetricsRecorder: Send + Sync {
    /// Reconciliation did not finish within the configured timeout. Carries
    /// the estimated quota, since the exact figure is unknown at this point.
    fn record_billing_timeout(&self, request_id: &str, estimated_quota: Quota);

    /// One external tool invocation completed, with its resolved cost.
    fn record_tool_invocation(&self, tool_name: &str, cost: Quota);

    /// Final quota reconciled for a request (signed delta vs pre-consumed).
    fn record_reconciled(&self, request_id: &str, delta: Quota);
}

/// Recorder that drops every event.
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record_billing_timeout(&self, _: &str, _: Quota) {}
    fn record_tool_invocation(&self, _: &str, _: Quota) {}
    fn record_reconciled(&self, _: &str, _: Quota) {}
}

/// Counting recorder used in tests.
#[derive(Default)]
pub struct CountingRecorder {
    pub billing_timeouts: AtomicU64,
    pub tool_invocations: AtomicU64,
    pub reconciliations: AtomicU64,
}

impl MetricsRecorder for CountingRecorder {
    fn record_billing_timeout(&self, _: &str, _: Quota) {
        self.billing_timeouts.fetch_add(1, Ordering::SeqCst);
    }

    fn record_tool_invocation(&self, _: &str, _: Quota) {
        self.tool_invocations.fetch_add(1, Ordering::SeqCst);
    }

    fn record_reconciled(&self, _: &str, _: Quota) {
        self.reconciliations.fetch_add(1, Ordering::SeqCst);
    }
}

static RECORDER: Lazy<RwLock<Arc<dyn MetricsRecorder>>> =
    Lazy::new(|| RwLock::new(Arc::new(NoopRecorder)));

/// Install the process-wide metrics recorder.
pub fn set_metrics_recorder(recorder: Arc<dyn MetricsRecorder>) {
    *RECORDER.write() = recorder;
}

/// Current process-wide metrics recorder.
pub fn metrics() -> Arc<dyn MetricsRecorder> {
    RECORDER.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counting_recorder_counts() {
        let recorder = CountingRecorder::default();
        recorder.record_billing_timeout("req", 100);
        recorder.record_tool_invocation("search", 50);
        recorder.record_tool_invocation("search", 50);
        assert_eq!(recorder.billing_timeouts.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.tool_invocations.load(Ordering::SeqCst), 2);
    }
}
