//! Domain Layer
//!
//! Value objects shared by the scrape core and the port traits its
//! collaborators implement.
//!
//! # Usage
//!
//! ```ignore
//! use chi_exporter::domain::{DiscoverySource, HostAddress, Prober};
//!
//! async fn probe_all<P: Prober>(prober: &P, hosts: &[HostAddress]) {
//!     let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
//!     for host in hosts {
//!         let result = prober.probe(host, deadline).await;
//!         // ...
//!     }
//! }
//! ```

pub mod ports;

pub use ports::{
    // Port traits
    DiscoverySource,
    Prober,
    QueryExecutor,
    // Value objects
    ClusterScope,
    ConnectionParams,
    HostAddress,
    MetricKind,
    MetricSample,
    ProbeOutcome,
    ProbeResult,
    Row,
    Samples,
    Scheme,
};
