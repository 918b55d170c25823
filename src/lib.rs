//! chi-exporter - ClickHouse cluster metrics exporter for Prometheus
//!
//! Periodically probes every member of a ClickHouse installation over its
//! HTTP interface, keeps the latest samples per host and serves them in the
//! Prometheus text format.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Watch Loop                              │
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │     Host     │───▶│    Scrape    │───▶│   Metrics    │       │
//! │  │  Directory   │    │ Coordinator  │    │   Registry   │       │
//! │  └──────────────┘    └──────┬───────┘    └──────┬───────┘       │
//! │                             │ per host          │               │
//! │                      ┌──────▼───────┐    ┌──────▼───────┐       │
//! │                      │    Prober    │    │ /metrics /chi│       │
//! │                      └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - ClickHouse, Kubernetes, static-list and Prometheus adapters
//! - [`config`] - Command-line configuration
//! - [`domain`] - Ports and value types
//! - [`error`] - Error types
//! - [`metrics`] - Directory, prober, coordinator, registry and watch loop
//! - [`server`] - HTTP endpoints

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod server;

// Re-export commonly used types
pub use config::{CliArgs, ExporterConfig};
pub use error::{Error, ProbeError, ProbeErrorKind, Result};
pub use metrics::{HostDirectory, MetricsRegistry, MetricsWatcher, ScrapeCoordinator};
