//! Metrics registry and the Prometheus exporter.

pub mod registry;
pub mod server;

pub use registry::Metrics;
pub use server::start_metrics_server;
