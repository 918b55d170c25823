//! Metrics Registry
//!
//! Latest known samples for every host, plus per-host staleness.
//!
//! ```text
//!   coordinator ──begin_update()──► RegistryUpdate ──stage──► commit()
//!                                                               │
//!                                                   Arc swap under write lock
//!                                                               │
//!   /metrics ◄──────────── current(): Arc<RegistrySnapshot> ◄────┘
//! ```
//!
//! Readers only ever clone an `Arc`, so an exposition in progress keeps the
//! snapshot it started with and never sees half of a round.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::debug;

use crate::domain::ports::{HostAddress, MetricKind, ProbeOutcome, ProbeResult, Samples};
use crate::error::{Error, ProbeErrorKind, Result};

// =============================================================================
// Snapshot Types
// =============================================================================

/// Everything the registry knows about one host.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostRecord {
    pub samples: Samples,
    pub last_success: Option<DateTime<Utc>>,
    pub last_attempt: DateTime<Utc>,
    pub stale: bool,
    pub last_error: Option<ProbeErrorKind>,
}

impl HostRecord {
    fn fresh(samples: Samples, at: DateTime<Utc>) -> Self {
        Self {
            samples,
            last_success: Some(at),
            last_attempt: at,
            stale: false,
            last_error: None,
        }
    }

    fn failed(kind: ProbeErrorKind, at: DateTime<Utc>) -> Self {
        Self {
            samples: Samples::new(),
            last_success: None,
            last_attempt: at,
            stale: true,
            last_error: Some(kind),
        }
    }
}

/// One (host, metric) pair as read by the exposition layer.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub host: HostAddress,
    pub metric: String,
    pub value: f64,
    pub kind: MetricKind,
    pub help: String,
    pub stale: bool,
    pub last_success: Option<DateTime<Utc>>,
}

/// Immutable view of the registry at one commit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistrySnapshot {
    pub hosts: BTreeMap<HostAddress, HostRecord>,
    pub generation: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RegistrySnapshot {
    /// Entries ordered by host, then metric name.
    pub fn entries(&self) -> Vec<RegistryEntry> {
        self.hosts
            .iter()
            .flat_map(|(host, record)| {
                record.samples.iter().map(move |(metric, sample)| RegistryEntry {
                    host: host.clone(),
                    metric: metric.clone(),
                    value: sample.value,
                    kind: sample.kind,
                    help: sample.help.clone(),
                    stale: record.stale,
                    last_success: record.last_success,
                })
            })
            .collect()
    }

    pub fn host(&self, host: &HostAddress) -> Option<&HostRecord> {
        self.hosts.get(host)
    }
}

// =============================================================================
// Staged Update
// =============================================================================

/// Changes staged against one snapshot generation.
#[derive(Debug)]
pub struct RegistryUpdate {
    base_generation: u64,
    hosts: BTreeMap<HostAddress, HostRecord>,
}

impl RegistryUpdate {
    /// Replace the host's samples and clear its staleness.
    pub fn record_success(&mut self, host: HostAddress, samples: Samples, at: DateTime<Utc>) {
        self.hosts.insert(host, HostRecord::fresh(samples, at));
    }

    /// Keep the host's samples, mark them stale and remember the error.
    pub fn record_failure(&mut self, host: HostAddress, kind: ProbeErrorKind, at: DateTime<Utc>) {
        match self.hosts.get_mut(&host) {
            Some(record) => {
                record.stale = true;
                record.last_error = Some(kind);
                record.last_attempt = at;
            }
            None => {
                self.hosts.insert(host, HostRecord::failed(kind, at));
            }
        }
    }

    pub fn apply(&mut self, result: &ProbeResult) {
        match &result.outcome {
            ProbeOutcome::Success { samples, .. } => {
                self.record_success(result.host.clone(), samples.clone(), result.observed_at)
            }
            ProbeOutcome::Failure(error) => {
                self.record_failure(result.host.clone(), error.kind, result.observed_at)
            }
        }
    }

    /// Drop every host not in `members`. Returns the pruned hosts.
    pub fn retain_hosts(&mut self, members: &BTreeSet<HostAddress>) -> Vec<HostAddress> {
        let departed: Vec<_> = self
            .hosts
            .keys()
            .filter(|host| !members.contains(*host))
            .cloned()
            .collect();
        for host in &departed {
            self.hosts.remove(host);
        }
        departed
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Copy-on-write store of the latest samples per host.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
    rounds_completed: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Cheap; never blocks on a merge in progress.
    pub fn current(&self) -> Arc<RegistrySnapshot> {
        Arc::clone(&self.current.read())
    }

    /// Ordered (host, metric) entries of the current snapshot.
    pub fn snapshot(&self) -> Vec<RegistryEntry> {
        self.current().entries()
    }

    /// Per-host status of the current snapshot.
    pub fn hosts(&self) -> BTreeMap<HostAddress, HostRecord> {
        self.current().hosts.clone()
    }

    /// Stage an update on top of the current snapshot.
    pub fn begin_update(&self) -> RegistryUpdate {
        let current = self.current();
        RegistryUpdate {
            base_generation: current.generation,
            hosts: current.hosts.clone(),
        }
    }

    /// Publish a staged update.
    ///
    /// Fails with `RegistryCorruption` if another commit happened since the
    /// update was staged.
    pub fn commit(&self, update: RegistryUpdate) -> Result<Arc<RegistrySnapshot>> {
        let mut current = self.current.write();
        if current.generation != update.base_generation {
            return Err(Error::RegistryCorruption(format!(
                "update staged at generation {} but registry is at {}",
                update.base_generation, current.generation
            )));
        }

        let next = Arc::new(RegistrySnapshot {
            hosts: update.hosts,
            generation: current.generation + 1,
            updated_at: Some(Utc::now()),
        });
        *current = Arc::clone(&next);
        drop(current);

        debug!(generation = next.generation, hosts = next.hosts.len(), "Registry committed");
        Ok(next)
    }

    /// Commit the merge of a whole round and count it.
    pub fn commit_round(&self, update: RegistryUpdate) -> Result<Arc<RegistrySnapshot>> {
        let snapshot = self.commit(update)?;
        self.rounds_completed.fetch_add(1, Ordering::Relaxed);
        Ok(snapshot)
    }

    pub fn rounds_completed(&self) -> u64 {
        self.rounds_completed.load(Ordering::Relaxed)
    }

    /// Single-host success, committed on its own.
    pub fn record_success(
        &self,
        host: HostAddress,
        samples: Samples,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut update = self.begin_update();
        update.record_success(host, samples, at);
        self.commit(update).map(|_| ())
    }

    /// Single-host failure, committed on its own.
    pub fn record_failure(
        &self,
        host: HostAddress,
        kind: ProbeErrorKind,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut update = self.begin_update();
        update.record_failure(host, kind, at);
        self.commit(update).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::MetricSample;
    use crate::error::ProbeError;
    use assert_matches::assert_matches;

    fn samples(pairs: &[(&str, f64)]) -> Samples {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), MetricSample::gauge(*value)))
            .collect()
    }

    fn host(name: &str) -> HostAddress {
        HostAddress::new(name)
    }

    #[test]
    fn test_empty_registry() {
        let registry = MetricsRegistry::new();
        assert!(registry.snapshot().is_empty());
        assert_eq!(registry.current().generation, 0);
        assert_eq!(registry.rounds_completed(), 0);
    }

    #[test]
    fn test_success_then_failure_keeps_samples_stale() {
        let registry = MetricsRegistry::new();
        let t0 = Utc::now();
        registry
            .record_success(host("a"), samples(&[("cpu_busy", 0.42)]), t0)
            .unwrap();
        registry
            .record_failure(host("a"), ProbeErrorKind::ConnectFailed, Utc::now())
            .unwrap();

        let entries = registry.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].value, 0.42);
        assert!(entries[0].stale);
        assert_eq!(entries[0].last_success, Some(t0));

        let record = registry.hosts().remove(&host("a")).unwrap();
        assert_eq!(record.last_error, Some(ProbeErrorKind::ConnectFailed));
    }

    #[test]
    fn test_first_failure_records_empty_stale_host() {
        let registry = MetricsRegistry::new();
        registry
            .record_failure(host("b"), ProbeErrorKind::Timeout, Utc::now())
            .unwrap();

        assert!(registry.snapshot().is_empty());
        let record = registry.current().host(&host("b")).cloned().unwrap();
        assert!(record.stale);
        assert!(record.samples.is_empty());
        assert_eq!(record.last_success, None);
    }

    #[test]
    fn test_success_clears_staleness() {
        let registry = MetricsRegistry::new();
        registry
            .record_failure(host("a"), ProbeErrorKind::AuthFailed, Utc::now())
            .unwrap();
        registry
            .record_success(host("a"), samples(&[("x", 1.0)]), Utc::now())
            .unwrap();

        let record = registry.current().host(&host("a")).cloned().unwrap();
        assert!(!record.stale);
        assert_eq!(record.last_error, None);
    }

    #[test]
    fn test_entries_are_ordered() {
        let registry = MetricsRegistry::new();
        let mut update = registry.begin_update();
        update.record_success(host("b"), samples(&[("z", 1.0), ("a", 2.0)]), Utc::now());
        update.record_success(host("a"), samples(&[("m", 3.0)]), Utc::now());
        registry.commit_round(update).unwrap();

        let keys: Vec<_> = registry
            .snapshot()
            .into_iter()
            .map(|e| (e.host.0, e.metric))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a".to_string(), "m".to_string()),
                ("b".to_string(), "a".to_string()),
                ("b".to_string(), "z".to_string()),
            ]
        );
        assert_eq!(registry.rounds_completed(), 1);
    }

    #[test]
    fn test_identical_rounds_are_idempotent() {
        let registry = MetricsRegistry::new();
        let round = |registry: &MetricsRegistry| {
            let mut update = registry.begin_update();
            update.apply(&ProbeResult::success(host("a"), samples(&[("q", 5.0)]), 0));
            update.apply(&ProbeResult::failure(host("b"), ProbeError::timeout("slow")));
            registry.commit_round(update).unwrap();
        };

        round(&registry);
        let first = registry.snapshot();
        round(&registry);
        let second = registry.snapshot();

        let strip = |entries: Vec<RegistryEntry>| {
            entries
                .into_iter()
                .map(|e| (e.host, e.metric, e.value, e.stale))
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(first), strip(second));
        assert_eq!(registry.hosts().len(), 2);
    }

    #[test]
    fn test_retain_hosts_prunes_departed() {
        let registry = MetricsRegistry::new();
        let mut update = registry.begin_update();
        update.record_success(host("a"), samples(&[("x", 1.0)]), Utc::now());
        update.record_success(host("gone"), samples(&[("x", 1.0)]), Utc::now());
        registry.commit(update).unwrap();

        let mut update = registry.begin_update();
        let members: BTreeSet<_> = [host("a")].into_iter().collect();
        let pruned = update.retain_hosts(&members);
        registry.commit(update).unwrap();

        assert_eq!(pruned, vec![host("gone")]);
        assert!(registry.current().host(&host("gone")).is_none());
    }

    #[test]
    fn test_stale_update_is_corruption() {
        let registry = MetricsRegistry::new();
        let first = registry.begin_update();
        let second = registry.begin_update();

        registry.commit(first).unwrap();
        let result = registry.commit(second);

        assert_matches!(result, Err(Error::RegistryCorruption(_)));
        assert_eq!(registry.current().generation, 1);
    }

    #[test]
    fn test_reader_keeps_its_snapshot() {
        let registry = MetricsRegistry::new();
        registry
            .record_success(host("a"), samples(&[("x", 1.0)]), Utc::now())
            .unwrap();

        let held = registry.current();
        registry
            .record_success(host("a"), samples(&[("x", 2.0)]), Utc::now())
            .unwrap();

        assert_eq!(held.entries()[0].value, 1.0);
        assert_eq!(registry.snapshot()[0].value, 2.0);
    }
}
