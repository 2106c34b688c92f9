//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by vlm-worker and provides
//! functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all vlm-worker metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Items finished by a batch run, labeled by stage and outcome.
pub static ITEMS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation attempts, labeled by call profile and outcome
/// (`clean`, `repetitive`, `transport_error`).
pub static GENERATION_ATTEMPTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Generation request latency in seconds, labeled by call profile.
pub static GENERATION_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Items moved from pending to processing by this process.
pub static ITEMS_CLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Time from spawning the inference server until it reported healthy.
pub static SERVER_STARTUP_SECONDS: OnceLock<Histogram> = OnceLock::new();

/// 1 while an inference server owned by this process is running.
pub static SERVER_RUNNING: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling it more than once is harmless; later calls leave the first set of
/// metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let items_total = CounterVec::new(
        Opts::new("vlm_worker_items_total", "Items processed by batch runs"),
        &["stage", "outcome"],
    )?;

    let generation_attempts = CounterVec::new(
        Opts::new(
            "vlm_worker_generation_attempts_total",
            "Chat completion attempts",
        ),
        &["call", "outcome"],
    )?;

    let generation_latency = HistogramVec::new(
        HistogramOpts::new(
            "vlm_worker_generation_latency_seconds",
            "Chat completion latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0]),
        &["call"],
    )?;

    let items_claimed = Counter::new(
        "vlm_worker_items_claimed_total",
        "Items claimed from the pending backlog",
    )?;

    let server_startup = Histogram::with_opts(
        HistogramOpts::new(
            "vlm_worker_server_startup_seconds",
            "Inference server time to healthy in seconds",
        )
        .buckets(vec![5.0, 10.0, 20.0, 30.0, 60.0, 90.0, 120.0, 180.0]),
    )?;

    let server_running = Gauge::new(
        "vlm_worker_server_running",
        "Whether an inference server is running",
    )?;

    registry.register(Box::new(items_total.clone()))?;
    registry.register(Box::new(generation_attempts.clone()))?;
    registry.register(Box::new(generation_latency.clone()))?;
    registry.register(Box::new(items_claimed.clone()))?;
    registry.register(Box::new(server_startup.clone()))?;
    registry.register(Box::new(server_running.clone()))?;

    // Already-set cells mean an earlier call won; keep those.
    let _ = REGISTRY.set(registry);
    let _ = ITEMS_TOTAL.set(items_total);
    let _ = GENERATION_ATTEMPTS_TOTAL.set(generation_attempts);
    let _ = GENERATION_LATENCY.set(generation_latency);
    let _ = ITEMS_CLAIMED_TOTAL.set(items_claimed);
    let _ = SERVER_STARTUP_SECONDS.set(server_startup);
    let _ = SERVER_RUNNING.set(server_running);

    tracing::debug!("Prometheus metrics initialized");
    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead when the registry was never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_export_contains_recorded_metrics() {
        let _ = init_metrics();
        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&["caption", "success"]).inc();
        }

        let text = export_metrics();
        assert!(!text.starts_with("# Error"));
        assert!(text.contains("vlm_worker_items_total"));
    }
}
