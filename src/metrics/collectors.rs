//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`init_metrics`](super::init_metrics) has
//! run, so library code can record unconditionally.

use super::prometheus::{
    GENERATION_ATTEMPTS_TOTAL, GENERATION_LATENCY, ITEMS_CLAIMED_TOTAL, ITEMS_TOTAL,
    SERVER_RUNNING, SERVER_STARTUP_SECONDS,
};

/// Metrics collector for recording worker operational metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record one item finishing a stage, e.g. `("caption", "success")`.
    pub fn record_item(&self, stage: &str, outcome: &str) {
        if let Some(items) = ITEMS_TOTAL.get() {
            items.with_label_values(&[stage, outcome]).inc();
        }
        tracing::trace!(stage, outcome, "Recorded item metric");
    }

    /// Record one chat completion attempt.
    pub fn record_generation_attempt(&self, call: &str, outcome: &str, latency_secs: f64) {
        if let Some(attempts) = GENERATION_ATTEMPTS_TOTAL.get() {
            attempts.with_label_values(&[call, outcome]).inc();
        }
        if let Some(latency) = GENERATION_LATENCY.get() {
            latency.with_label_values(&[call]).observe(latency_secs);
        }
    }

    pub fn record_claimed(&self, count: usize) {
        if let Some(claimed) = ITEMS_CLAIMED_TOTAL.get() {
            claimed.inc_by(count as f64);
        }
    }

    pub fn record_server_startup(&self, secs: f64) {
        if let Some(startup) = SERVER_STARTUP_SECONDS.get() {
            startup.observe(secs);
        }
    }

    pub fn set_server_running(&self, running: bool) {
        if let Some(gauge) = SERVER_RUNNING.get() {
            gauge.set(if running { 1.0 } else { 0.0 });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::init_metrics;

    #[test]
    fn test_recording_after_init() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();
        let before = ITEMS_CLAIMED_TOTAL.get().map(|c| c.get()).unwrap_or(0.0);

        collector.record_claimed(3);
        collector.record_generation_attempt("image_chat", "clean", 1.5);
        collector.set_server_running(true);

        let after = ITEMS_CLAIMED_TOTAL.get().map(|c| c.get()).unwrap_or(0.0);
        assert!(after - before >= 3.0);
        collector.set_server_running(false);
    }
}
