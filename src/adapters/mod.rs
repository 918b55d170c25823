//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │      DiscoverySource │ QueryExecutor │ Prober               │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ StaticDiscovery │ KubernetesDiscovery │ HttpQueryExecutor  │ │
//! │  │ PrometheusExposition │ ExporterMetrics                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use chi_exporter::adapters::{HttpQueryExecutor, StaticDiscovery};
//! use chi_exporter::domain::ports::QueryExecutor;
//!
//! let executor = HttpQueryExecutor::new(params)?;
//! let rows = executor.query(&host, "SELECT 1").await?;
//! ```

mod clickhouse;
mod kubernetes;
mod prometheus;
mod static_list;

pub use self::clickhouse::{parse_tab_separated, HttpQueryExecutor};
pub use self::kubernetes::{members_from_pods, KubernetesDiscovery, CHI_LABEL};
pub use self::prometheus::{ExporterMetrics, PrometheusExposition, CONTENT_TYPE, HOST_LABELS};
pub use self::static_list::StaticDiscovery;
