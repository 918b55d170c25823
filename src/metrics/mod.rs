//! Metrics module
//!
//! The scrape core: directory of cluster members, per-host prober, round
//! coordinator, registry of latest samples and the loop driving them.

pub mod coordinator;
pub mod directory;
pub mod prober;
pub mod registry;
pub mod watcher;

pub use coordinator::{RoundReport, ScrapeCoordinator};
pub use directory::{DirectoryListing, HostDirectory, MembershipChange};
pub use prober::{normalize_metric_name, IntrospectionQuery, MetricsProber, DEFAULT_QUERIES};
pub use registry::{HostRecord, MetricsRegistry, RegistryEntry, RegistrySnapshot, RegistryUpdate};
pub use watcher::{MetricsWatcher, WatchConfig, WatchState};
