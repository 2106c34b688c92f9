//! Prometheus metrics for batch runs.
//!
//! # Example
//!
//! ```ignore
//! use vlm_worker::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_item("caption", "success");
//! std::fs::write("metrics.prom", export_metrics())?;
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
