//! Metrics collection for ChatRelay
//!
//! This module provides Prometheus metrics for the relay worker.

use lazy_static::lazy_static;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for ChatRelay
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub worker: WorkerMetrics,
    pub inference: InferenceMetrics,
}

/// Control connection and assignment metrics
#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    /// Assignments received while ready
    pub assignments_total: IntCounter,

    /// Assignments closed with a terminal packet
    pub assignments_completed: IntCounter,

    /// Assignments abandoned after a failure
    pub assignments_failed: IntCounter,

    /// Assignments rejected because another one was in flight
    pub assignments_rejected: IntCounter,

    /// Token packets forwarded to the backend
    pub tokens_relayed_total: IntCounter,

    /// End-to-end assignment duration
    pub assignment_duration: Histogram,

    /// Control connection attempts
    pub connection_attempts: IntCounter,

    /// 1 while the control connection is up
    pub connected: IntGauge,
}

/// Inference server metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Streaming generation requests issued
    pub requests_total: IntCounter,

    /// Requests rejected with a non-success status or failed in transport
    pub request_errors: IntCounter,

    /// Time from request to first streamed packet
    pub time_to_first_token: Histogram,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry =
        MetricsRegistry::new().expect("static metric definitions are valid");
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        // Worker metrics
        let assignments_total = IntCounter::new(
            "relay_assignments_total",
            "Total number of assignments received",
        )?;

        let assignments_completed = IntCounter::new(
            "relay_assignments_completed_total",
            "Total number of assignments closed with a terminal packet",
        )?;

        let assignments_failed = IntCounter::new(
            "relay_assignments_failed_total",
            "Total number of failed assignments",
        )?;

        let assignments_rejected = IntCounter::new(
            "relay_assignments_rejected_total",
            "Total number of assignments rejected while busy",
        )?;

        let tokens_relayed_total = IntCounter::new(
            "relay_tokens_relayed_total",
            "Total number of token packets forwarded",
        )?;

        let assignment_duration = Histogram::with_opts(
            HistogramOpts::new(
                "relay_assignment_duration_seconds",
                "Assignment duration in seconds",
            )
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;

        let connection_attempts = IntCounter::new(
            "relay_connection_attempts_total",
            "Total number of control connection attempts",
        )?;

        let connected = IntGauge::new(
            "relay_connected",
            "Whether the control connection is up",
        )?;

        // Inference metrics
        let requests_total = IntCounter::new(
            "inference_requests_total",
            "Total number of streaming generation requests",
        )?;

        let request_errors = IntCounter::new(
            "inference_request_errors_total",
            "Total number of failed generation requests",
        )?;

        let time_to_first_token = Histogram::with_opts(
            HistogramOpts::new(
                "inference_time_to_first_token_seconds",
                "Time until the first streamed packet in seconds",
            )
            .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )?;

        // Register all metrics
        registry.register(Box::new(assignments_total.clone()))?;
        registry.register(Box::new(assignments_completed.clone()))?;
        registry.register(Box::new(assignments_failed.clone()))?;
        registry.register(Box::new(assignments_rejected.clone()))?;
        registry.register(Box::new(tokens_relayed_total.clone()))?;
        registry.register(Box::new(assignment_duration.clone()))?;
        registry.register(Box::new(connection_attempts.clone()))?;
        registry.register(Box::new(connected.clone()))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_errors.clone()))?;
        registry.register(Box::new(time_to_first_token.clone()))?;

        let worker = WorkerMetrics {
            assignments_total,
            assignments_completed,
            assignments_failed,
            assignments_rejected,
            tokens_relayed_total,
            assignment_duration,
            connection_attempts,
            connected,
        };

        let inference = InferenceMetrics {
            requests_total,
            request_errors,
            time_to_first_token,
        };

        Ok(MetricsRegistry {
            registry,
            worker,
            inference,
        })
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    /// One-line summary of the assignment counters
    pub fn summary(&self) -> String {
        format!(
            "assignments={} completed={} failed={} rejected={} tokens={} connection_attempts={}",
            self.worker.assignments_total.get(),
            self.worker.assignments_completed.get(),
            self.worker.assignments_failed.get(),
            self.worker.assignments_rejected.get(),
            self.worker.tokens_relayed_total.get(),
            self.worker.connection_attempts.get(),
        )
    }
}
