//! Domain Ports (DDD Port/Adapter Pattern)
//!
//! This module defines the core abstractions (ports) that the scrape core
//! depends on. Infrastructure adapters implement these traits to provide
//! concrete implementations.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scrape Core                           │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │   DiscoverySource │ QueryExecutor │ Prober          │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │ StaticDiscovery │ KubernetesDiscovery │ HttpQuery.. │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, ProbeError, ProbeErrorKind, Result};

// =============================================================================
// Value Objects
// =============================================================================

/// Address of one cluster member (hostname or IP, without port).
///
/// Equality is exact-string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct HostAddress(pub String);

impl HostAddress {
    pub fn new(host: impl Into<String>) -> Self {
        Self(host.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for HostAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for HostAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Namespace and cluster name identifying one watched installation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ClusterScope {
    pub namespace: String,
    #[serde(rename = "name")]
    pub cluster_name: String,
}

impl ClusterScope {
    pub fn new(namespace: impl Into<String>, cluster_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            cluster_name: cluster_name.into(),
        }
    }
}

impl fmt::Display for ClusterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.cluster_name)
    }
}

/// HTTP scheme used to reach cluster members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::Config(format!("unsupported scheme: {}", other))),
        }
    }
}

/// How to reach any one cluster member. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    scheme: Scheme,
    username: String,
    password: String,
    root_ca: Option<PathBuf>,
    port: u16,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl ConnectionParams {
    /// Build validated connection parameters.
    pub fn new(
        scheme: Scheme,
        username: impl Into<String>,
        password: impl Into<String>,
        root_ca: Option<PathBuf>,
        port: u16,
        connect_timeout: Duration,
        query_timeout: Duration,
    ) -> Result<Self> {
        if port == 0 {
            return Err(Error::Config("port must be non-zero".into()));
        }
        if connect_timeout.is_zero() || query_timeout.is_zero() {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }

        Ok(Self {
            scheme,
            username: username.into(),
            password: password.into(),
            root_ca,
            port,
            connect_timeout,
            query_timeout,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn root_ca(&self) -> Option<&PathBuf> {
        self.root_ca.as_ref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Base URL of the HTTP interface on `host`.
    pub fn base_url(&self, host: &HostAddress) -> String {
        format!("{}://{}:{}/", self.scheme, host, self.port)
    }
}

impl fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("scheme", &self.scheme)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("root_ca", &self.root_ca)
            .field("port", &self.port)
            .field("connect_timeout", &self.connect_timeout)
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

/// Prometheus type of an exported sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Gauge,
    Counter,
}

/// One normalized metric value observed on a host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSample {
    pub value: f64,
    pub kind: MetricKind,
    pub help: String,
}

impl MetricSample {
    pub fn gauge(value: f64) -> Self {
        Self {
            value,
            kind: MetricKind::Gauge,
            help: String::new(),
        }
    }

    pub fn counter(value: f64) -> Self {
        Self {
            value,
            kind: MetricKind::Counter,
            help: String::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }
}

/// Samples keyed by normalized metric name.
pub type Samples = BTreeMap<String, MetricSample>;

/// Outcome of one probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { samples: Samples, skipped_rows: usize },
    Failure(ProbeError),
}

/// Result of one probe against one host. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub host: HostAddress,
    pub observed_at: DateTime<Utc>,
    pub outcome: ProbeOutcome,
}

impl ProbeResult {
    pub fn success(host: HostAddress, samples: Samples, skipped_rows: usize) -> Self {
        Self {
            host,
            observed_at: Utc::now(),
            outcome: ProbeOutcome::Success {
                samples,
                skipped_rows,
            },
        }
    }

    pub fn failure(host: HostAddress, error: ProbeError) -> Self {
        Self {
            host,
            observed_at: Utc::now(),
            outcome: ProbeOutcome::Failure(error),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ProbeOutcome::Success { .. })
    }

    pub fn error_kind(&self) -> Option<ProbeErrorKind> {
        match &self.outcome {
            ProbeOutcome::Failure(e) => Some(e.kind),
            ProbeOutcome::Success { .. } => None,
        }
    }
}

/// One row of a tabular query response.
pub type Row = Vec<String>;

// =============================================================================
// Discovery Port
// =============================================================================

/// Port for enumerating the members of a cluster.
///
/// Implementations must return an error rather than an empty set when the
/// lookup itself failed.
#[async_trait]
pub trait DiscoverySource: Send + Sync {
    /// List current members for the scope.
    async fn list_members(&self, scope: &ClusterScope) -> Result<BTreeSet<HostAddress>>;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

// =============================================================================
// Query Port
// =============================================================================

/// Port for running a read-only introspection query on one host.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute `sql` against `host` and return its rows.
    async fn query(
        &self,
        host: &HostAddress,
        sql: &str,
    ) -> std::result::Result<Vec<Row>, ProbeError>;
}

// =============================================================================
// Prober Port
// =============================================================================

/// Port for collecting one round of metrics from one host.
///
/// Implementations must not panic and must honour `deadline`.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, host: &HostAddress, deadline: tokio::time::Instant) -> ProbeResult;
}

// =============================================================================
// Tests
// =============================================================================
