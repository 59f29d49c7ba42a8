//! Metrics contains the metrics helpers for the controllers.
//!
//! Counters are published through the `metrics` facade; the binary installs a Prometheus
//! exporter over them.

/// Reconcile records one reconciler invocation.
pub fn reconcile(controller: &str) {
    metrics::counter!("kro_reconciles_total", "controller" => controller.to_string())
        .increment(1);
}

/// Failure records one reconciler invocation that resulted in an error.
pub fn failure(controller: &str) {
    metrics::counter!("kro_reconcile_failures_total", "controller" => controller.to_string())
        .increment(1);
}

/// Requeue records one backoff requeue.
pub fn requeue(controller: &str) {
    metrics::counter!("kro_reconcile_requeues_total", "controller" => controller.to_string())
        .increment(1);
}
