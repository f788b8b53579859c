//! Metrics collection for TokenMux
//!
//! This module provides Prometheus metrics for observability.
//! All metrics are carefully designed to minimize overhead in the hot path.

use lazy_static::lazy_static;
use prometheus::{Histogram, IntCounter, IntGauge, Registry};
use std::sync::Arc;

/// Metrics registry for TokenMux
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub sessions: SessionMetrics,
    pub inference: InferenceMetrics,
    pub store: StoreMetrics,
}

/// Session lifecycle metrics
#[derive(Debug, Clone)]
pub struct SessionMetrics {
    /// Current number of live sessions
    pub active_sessions: IntGauge,

    /// Total sessions created
    pub sessions_created_total: IntCounter,

    /// Total sessions closed
    pub sessions_closed_total: IntCounter,

    /// Current number of loaded model instances
    pub loaded_models: IntGauge,

    /// Current number of live execution contexts
    pub active_contexts: IntGauge,
}

/// Inference-related metrics
#[derive(Debug, Clone)]
pub struct InferenceMetrics {
    /// Total number of inference requests
    pub requests_total: IntCounter,

    /// Total requests rejected with a single-flight conflict
    pub requests_conflicted: IntCounter,

    /// Total requests cancelled mid-stream
    pub requests_cancelled: IntCounter,

    /// Request duration histogram
    pub request_duration: Histogram,

    /// Tokens generated total
    pub tokens_generated_total: IntCounter,

    /// Context overflow evictions total
    pub context_evictions_total: IntCounter,

    /// Current completion queue depth
    pub queue_depth: IntGauge,
}

/// Checkpoint store metrics
#[derive(Debug, Clone)]
pub struct StoreMetrics {
    /// Checkpoints saved total
    pub saves_total: IntCounter,

    /// Checkpoints loaded total
    pub loads_total: IntCounter,

    /// Checkpoint load failures (corrupt, incompatible, or unconfigured model)
    pub load_failures_total: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Session metrics
        let active_sessions = IntGauge::new(
            "tokenmux_active_sessions",
            "Current number of live sessions"
        ).unwrap();

        let sessions_created_total = IntCounter::new(
            "tokenmux_sessions_created_total",
            "Total number of sessions created"
        ).unwrap();

        let sessions_closed_total = IntCounter::new(
            "tokenmux_sessions_closed_total",
            "Total number of sessions closed"
        ).unwrap();

        let loaded_models = IntGauge::new(
            "tokenmux_loaded_models",
            "Current number of loaded model instances"
        ).unwrap();

        let active_contexts = IntGauge::new(
            "tokenmux_active_contexts",
            "Current number of live execution contexts"
        ).unwrap();

        // Inference metrics
        let requests_total = IntCounter::new(
            "tokenmux_inference_requests_total",
            "Total number of inference requests"
        ).unwrap();

        let requests_conflicted = IntCounter::new(
            "tokenmux_inference_requests_conflicted_total",
            "Requests rejected because an operation was already in flight"
        ).unwrap();

        let requests_cancelled = IntCounter::new(
            "tokenmux_inference_requests_cancelled_total",
            "Requests cancelled before completion"
        ).unwrap();

        let request_duration = Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "tokenmux_inference_request_duration_seconds",
                "Inference request duration in seconds"
            ).buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
        ).unwrap();

        let tokens_generated_total = IntCounter::new(
            "tokenmux_tokens_generated_total",
            "Total number of tokens generated"
        ).unwrap();

        let context_evictions_total = IntCounter::new(
            "tokenmux_context_evictions_total",
            "Total number of context-overflow evictions"
        ).unwrap();

        let queue_depth = IntGauge::new(
            "tokenmux_queue_depth",
            "Current depth of the completion queue"
        ).unwrap();

        // Store metrics
        let saves_total = IntCounter::new(
            "tokenmux_checkpoint_saves_total",
            "Total number of session checkpoints saved"
        ).unwrap();

        let loads_total = IntCounter::new(
            "tokenmux_checkpoint_loads_total",
            "Total number of session checkpoints loaded"
        ).unwrap();

        let load_failures_total = IntCounter::new(
            "tokenmux_checkpoint_load_failures_total",
            "Checkpoint loads that failed to read or validate"
        ).unwrap();

        // Register all metrics
        registry.register(Box::new(active_sessions.clone())).unwrap();
        registry.register(Box::new(sessions_created_total.clone())).unwrap();
        registry.register(Box::new(sessions_closed_total.clone())).unwrap();
        registry.register(Box::new(loaded_models.clone())).unwrap();
        registry.register(Box::new(active_contexts.clone())).unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(requests_conflicted.clone())).unwrap();
        registry.register(Box::new(requests_cancelled.clone())).unwrap();
        registry.register(Box::new(request_duration.clone())).unwrap();
        registry.register(Box::new(tokens_generated_total.clone())).unwrap();
        registry.register(Box::new(context_evictions_total.clone())).unwrap();
        registry.register(Box::new(queue_depth.clone())).unwrap();

        registry.register(Box::new(saves_total.clone())).unwrap();
        registry.register(Box::new(loads_total.clone())).unwrap();
        registry.register(Box::new(load_failures_total.clone())).unwrap();

        let sessions = SessionMetrics {
            active_sessions,
            sessions_created_total,
            sessions_closed_total,
            loaded_models,
            active_contexts,
        };

        let inference = InferenceMetrics {
            requests_total,
            requests_conflicted,
            requests_cancelled,
            request_duration,
            tokens_generated_total,
            context_evictions_total,
            queue_depth,
        };

        let store = StoreMetrics {
            saves_total,
            loads_total,
            load_failures_total,
        };

        MetricsRegistry {
            registry,
            sessions,
            inference,
            store,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.sessions.active_sessions.inc();
        metrics.inference.requests_total.inc();
        metrics.inference.queue_depth.set(3);

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("tokenmux_active_sessions"));
        assert!(output.contains("tokenmux_queue_depth"));
    }
}
