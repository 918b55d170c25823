//! Error types for the ClickHouse metrics exporter

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the exporter
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Prometheus collector or encoding error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// HTTP client construction error
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// Member discovery failed; the directory keeps its last known members
    #[error("Discovery failed for {scope}: {reason}")]
    DiscoveryFailed { scope: String, reason: String },

    /// Registry invariant violated. Unreachable with a single committer.
    #[error("Registry corruption: {0}")]
    RegistryCorruption(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Duration parse error
    #[error("Failed to parse duration: {0}")]
    DurationParse(String),

    /// HTTP server error
    #[error("Server error: {0}")]
    Server(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

// =============================================================================
// Probe Errors
// =============================================================================

/// Classification of a failed per-host probe.
///
/// Probe failures are recoverable and never abort a scrape round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeErrorKind {
    ConnectFailed,
    AuthFailed,
    Timeout,
    QueryFailed,
    MalformedResponse,
}

impl ProbeErrorKind {
    /// All kinds, in label order
    pub const ALL: [ProbeErrorKind; 5] = [
        ProbeErrorKind::ConnectFailed,
        ProbeErrorKind::AuthFailed,
        ProbeErrorKind::Timeout,
        ProbeErrorKind::QueryFailed,
        ProbeErrorKind::MalformedResponse,
    ];

    /// Label value used in exported series
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::ConnectFailed => "connect_failed",
            ProbeErrorKind::AuthFailed => "auth_failed",
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::QueryFailed => "query_failed",
            ProbeErrorKind::MalformedResponse => "malformed_response",
        }
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified probe failure with a human-readable detail message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProbeError {
    pub kind: ProbeErrorKind,
    pub message: String,
}

impl ProbeError {
    pub fn new(kind: ProbeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProbeErrorKind::MalformedResponse, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_error_display() {
        let err = ProbeError::new(ProbeErrorKind::AuthFailed, "bad password");
        assert_eq!(err.to_string(), "auth_failed: bad password");
    }

    #[test]
    fn test_probe_error_kind_labels_unique() {
        let mut labels: Vec<_> = ProbeErrorKind::ALL.iter().map(|k| k.as_str()).collect();
        labels.sort();
        labels.dedup();
        assert_eq!(labels.len(), ProbeErrorKind::ALL.len());
    }

    #[test]
    fn test_discovery_failed_display() {
        let err = Error::DiscoveryFailed {
            scope: "default/prod".into(),
            reason: "timed out".into(),
        };
        assert_eq!(
            err.to_string(),
            "Discovery failed for default/prod: timed out"
        );
    }

    #[test]
    fn test_probe_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ProbeErrorKind::MalformedResponse).unwrap();
        assert_eq!(json, "\"malformed_response\"");
    }
}
