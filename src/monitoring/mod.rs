//! Observability hooks for the accounting core.

pub mod metrics;

pub use metrics::{
    metrics, set_metrics_recorder, CountingRecorder, MetricsRecorder, NoopRecorder,
};
