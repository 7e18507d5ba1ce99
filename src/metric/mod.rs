//! # Metrics exporter capability
//!
//! Configures and supervises a Prometheus exporter that scrapes one server's
//! monitoring endpoint. The scrape protocol itself lives in the exporter.

pub mod capability;
pub mod options;

pub use capability::MetricCapability;
pub use options::{ExporterOptions, MonitoredServer};
