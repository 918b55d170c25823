//! Scrape Coordinator
//!
//! Runs one round: probe every member of a directory snapshot concurrently,
//! wait until all answer or the round deadline passes, then merge the
//! results into the registry in a single commit.
//!
//! ```text
//!   members ─┬─► task(h1) ─┐
//!            ├─► task(h2) ─┼─► join until deadline ─► RegistryUpdate ─► commit
//!            └─► task(h3) ─┘        │
//!                                   └─ late hosts: Timeout, task aborted
//! ```

use std::any::Any;
use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

use crate::adapters::ExporterMetrics;
use crate::domain::ports::{HostAddress, ProbeOutcome, ProbeResult, Prober};
use crate::error::{ProbeError, ProbeErrorKind, Result};
use crate::metrics::directory::HostDirectory;
use crate::metrics::registry::MetricsRegistry;

/// Default wall-clock bound on one round.
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(25);

/// Summary of one completed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    pub round: u64,
    pub hosts: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub skipped_rows: usize,
    pub pruned: usize,
    pub elapsed: Duration,
}

/// Fans probes out over a member snapshot and merges the outcome.
pub struct ScrapeCoordinator {
    prober: Arc<dyn Prober>,
    registry: Arc<MetricsRegistry>,
    exporter_metrics: Arc<ExporterMetrics>,
    round_timeout: Duration,
    rounds: AtomicU64,
}

impl ScrapeCoordinator {
    pub fn new(
        prober: Arc<dyn Prober>,
        registry: Arc<MetricsRegistry>,
        exporter_metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self {
            prober,
            registry,
            exporter_metrics,
            round_timeout: DEFAULT_ROUND_TIMEOUT,
            rounds: AtomicU64::new(0),
        }
    }

    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.round_timeout = round_timeout;
        self
    }

    pub fn registry(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    pub fn round_timeout(&self) -> Duration {
        self.round_timeout
    }

    /// Run one round over the directory's current snapshot.
    pub async fn run_round(&self, directory: &HostDirectory) -> Result<RoundReport> {
        let members = directory.current_members();
        self.run_round_for(&members).await
    }

    /// Run one round over an explicit member set.
    ///
    /// Per-host failures are recorded, never returned. The only error is a
    /// registry commit failure.
    #[instrument(skip(self, members), fields(hosts = members.len()))]
    pub async fn run_round_for(&self, members: &BTreeSet<HostAddress>) -> Result<RoundReport> {
        let round = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let started = Instant::now();
        let deadline = started + self.round_timeout;

        let mut tasks = JoinSet::new();
        for host in members.iter().cloned() {
            let prober = Arc::clone(&self.prober);
            tasks.spawn(async move {
                let outcome = AssertUnwindSafe(prober.probe(&host, deadline))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(result) => result,
                    Err(panic) => ProbeResult::failure(
                        host,
                        ProbeError::new(
                            ProbeErrorKind::QueryFailed,
                            format!("probe panicked: {}", panic_message(&*panic)),
                        ),
                    ),
                }
            });
        }

        let mut pending: BTreeSet<HostAddress> = members.clone();
        let mut results = Vec::with_capacity(members.len());
        let mut deadline_hit = false;

        loop {
            match timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(result))) => {
                    pending.remove(&result.host);
                    results.push(result);
                }
                Ok(Some(Err(e))) => warn!(error = %e, "Probe task failed"),
                Ok(None) => break,
                Err(_) => {
                    deadline_hit = true;
                    tasks.abort_all();
                    break;
                }
            }
        }

        for host in pending {
            let error = if deadline_hit {
                ProbeError::timeout(format!("no result within {:?}", self.round_timeout))
            } else {
                ProbeError::new(ProbeErrorKind::QueryFailed, "probe task ended without a result")
            };
            results.push(ProbeResult::failure(host, error));
        }

        let mut report = RoundReport {
            round,
            hosts: members.len(),
            succeeded: 0,
            failed: 0,
            timed_out: 0,
            skipped_rows: 0,
            pruned: 0,
            elapsed: Duration::ZERO,
        };

        let mut update = self.registry.begin_update();
        for result in &results {
            match &result.outcome {
                ProbeOutcome::Success { skipped_rows, .. } => {
                    report.succeeded += 1;
                    report.skipped_rows += skipped_rows;
                }
                ProbeOutcome::Failure(error) => {
                    report.failed += 1;
                    if error.kind == ProbeErrorKind::Timeout {
                        report.timed_out += 1;
                    }
                    self.exporter_metrics.probe_failed(error.kind);
                    warn!(
                        host = %result.host,
                        kind = %error.kind,
                        error = %error.message,
                        "Probe failed"
                    );
                }
            }
            update.apply(result);
        }

        let pruned = update.retain_hosts(members);
        if !pruned.is_empty() {
            debug!(?pruned, "Pruned departed hosts");
        }
        report.pruned = pruned.len();

        self.registry.commit_round(update)?;

        report.elapsed = started.elapsed();
        self.exporter_metrics
            .observe_round(report.elapsed, report.skipped_rows);
        self.exporter_metrics.set_members(members.len());

        info!(
            round,
            succeeded = report.succeeded,
            failed = report.failed,
            timed_out = report.timed_out,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Scrape round complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ScrapeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScrapeCoordinator")
            .field("round_timeout", &self.round_timeout)
            .field("rounds", &self.rounds.load(Ordering::Relaxed))
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{MetricSample, Samples};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    enum Behavior {
        Value(f64),
        Fail(ProbeErrorKind),
        Hang,
        Panic,
    }

    /// Prober whose per-host behavior can be changed between rounds.
    #[derive(Default)]
    struct FakeProber {
        behaviors: Mutex<HashMap<String, Behavior>>,
    }

    impl FakeProber {
        fn set(&self, host: &str, behavior: Behavior) {
            self.behaviors.lock().insert(host.to_string(), behavior);
        }
    }

    #[async_trait]
    impl Prober for FakeProber {
        async fn probe(&self, host: &HostAddress, _deadline: Instant) -> ProbeResult {
            let behavior = self
                .behaviors
                .lock()
                .get(host.as_str())
                .cloned()
                .unwrap_or(Behavior::Value(1.0));

            match behavior {
                Behavior::Value(v) => {
                    let mut samples = Samples::new();
                    samples.insert("cpu_busy".to_string(), MetricSample::gauge(v));
                    ProbeResult::success(host.clone(), samples, 0)
                }
                Behavior::Fail(kind) => {
                    ProbeResult::failure(host.clone(), ProbeError::new(kind, "scripted"))
                }
                Behavior::Hang => std::future::pending::<ProbeResult>().await,
                Behavior::Panic => panic!("scripted panic"),
            }
        }
    }

    fn members(hosts: &[&str]) -> BTreeSet<HostAddress> {
        hosts.iter().map(|h| HostAddress::new(*h)).collect()
    }

    fn coordinator(prober: Arc<FakeProber>, round_timeout: Duration) -> ScrapeCoordinator {
        ScrapeCoordinator::new(
            prober,
            Arc::new(MetricsRegistry::new()),
            Arc::new(ExporterMetrics::new().unwrap()),
        )
        .with_round_timeout(round_timeout)
    }

    fn value_of(registry: &MetricsRegistry, host: &str) -> Option<f64> {
        registry
            .current()
            .host(&HostAddress::new(host))
            .and_then(|r| r.samples.get("cpu_busy").map(|s| s.value))
    }

    fn is_stale(registry: &MetricsRegistry, host: &str) -> bool {
        registry
            .current()
            .host(&HostAddress::new(host))
            .map(|r| r.stale)
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn test_round_with_one_hung_host() {
        let prober = Arc::new(FakeProber::default());
        prober.set("h1", Behavior::Value(0.42));
        prober.set("h2", Behavior::Hang);
        prober.set("h3", Behavior::Value(0.10));
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_millis(200));
        let registry = Arc::clone(coordinator.registry());
        let hosts = members(&["h1", "h2", "h3"]);

        let report = coordinator.run_round_for(&hosts).await.unwrap();

        assert_eq!(report.succeeded, 2);
        assert_eq!(report.timed_out, 1);
        assert_eq!(value_of(&registry, "h1"), Some(0.42));
        assert_eq!(value_of(&registry, "h3"), Some(0.10));
        assert!(!is_stale(&registry, "h1"));
        // First round: h2 has no samples yet but is present and stale.
        assert_eq!(value_of(&registry, "h2"), None);
        assert!(is_stale(&registry, "h2"));
        assert_eq!(
            registry.current().host(&HostAddress::new("h2")).unwrap().last_error,
            Some(ProbeErrorKind::Timeout)
        );
    }

    #[tokio::test]
    async fn test_hung_host_keeps_previous_samples() {
        let prober = Arc::new(FakeProber::default());
        prober.set("h2", Behavior::Value(0.77));
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_millis(150));
        let registry = Arc::clone(coordinator.registry());
        let hosts = members(&["h1", "h2", "h3"]);

        coordinator.run_round_for(&hosts).await.unwrap();
        prober.set("h2", Behavior::Hang);
        coordinator.run_round_for(&hosts).await.unwrap();

        assert_eq!(value_of(&registry, "h2"), Some(0.77));
        assert!(is_stale(&registry, "h2"));
        assert!(!is_stale(&registry, "h1"));
    }

    #[tokio::test]
    async fn test_round_is_bounded_by_deadline() {
        let prober = Arc::new(FakeProber::default());
        for host in ["a", "b", "c", "d"] {
            prober.set(host, Behavior::Hang);
        }
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_millis(100));

        let started = std::time::Instant::now();
        let report = coordinator
            .run_round_for(&members(&["a", "b", "c", "d"]))
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.timed_out, 4);
        assert_eq!(report.succeeded, 0);
    }

    #[tokio::test]
    async fn test_failing_host_does_not_affect_others() {
        let prober = Arc::new(FakeProber::default());
        prober.set("a", Behavior::Value(5.0));
        prober.set("b", Behavior::Fail(ProbeErrorKind::ConnectFailed));
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_secs(5));
        let registry = Arc::clone(coordinator.registry());

        let started = std::time::Instant::now();
        let report = coordinator.run_round_for(&members(&["a", "b"])).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(report.failed, 1);
        assert_eq!(value_of(&registry, "a"), Some(5.0));
        assert!(!is_stale(&registry, "a"));
        assert!(is_stale(&registry, "b"));
    }

    #[tokio::test]
    async fn test_panicking_probe_is_contained() {
        let prober = Arc::new(FakeProber::default());
        prober.set("bad", Behavior::Panic);
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_secs(5));
        let registry = Arc::clone(coordinator.registry());

        let report = coordinator
            .run_round_for(&members(&["bad", "good"]))
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        let record = registry.current().host(&HostAddress::new("bad")).cloned().unwrap();
        assert_matches!(record.last_error, Some(ProbeErrorKind::QueryFailed));
    }

    #[tokio::test]
    async fn test_every_member_has_an_entry() {
        let prober = Arc::new(FakeProber::default());
        prober.set("x2", Behavior::Fail(ProbeErrorKind::AuthFailed));
        prober.set("x4", Behavior::Hang);
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_millis(100));
        let hosts = members(&["x1", "x2", "x3", "x4"]);

        coordinator.run_round_for(&hosts).await.unwrap();

        let snapshot = coordinator.registry().current();
        let recorded: BTreeSet<_> = snapshot.hosts.keys().cloned().collect();
        assert_eq!(recorded, hosts);
    }

    #[tokio::test]
    async fn test_departed_hosts_are_pruned() {
        let prober = Arc::new(FakeProber::default());
        let coordinator = coordinator(Arc::clone(&prober), Duration::from_secs(1));

        coordinator.run_round_for(&members(&["a", "b"])).await.unwrap();
        let report = coordinator.run_round_for(&members(&["a"])).await.unwrap();

        assert_eq!(report.pruned, 1);
        assert!(coordinator.registry().current().host(&HostAddress::new("b")).is_none());
        assert_eq!(coordinator.registry().rounds_completed(), 2);
    }

    #[tokio::test]
    async fn test_empty_round_completes() {
        let coordinator = coordinator(Arc::new(FakeProber::default()), Duration::from_secs(1));
        let report = coordinator.run_round_for(&BTreeSet::new()).await.unwrap();

        assert_eq!(report.hosts, 0);
        assert_eq!(report.round, 1);
        assert_eq!(coordinator.registry().rounds_completed(), 1);
    }

    #[tokio::test]
    async fn test_round_from_directory_snapshot() {
        let directory = HostDirectory::with_static_members(
            crate::domain::ports::ClusterScope::new("default", "prod"),
            ["127.0.0.1"],
        );
        let coordinator = coordinator(Arc::new(FakeProber::default()), Duration::from_secs(1));

        let report = coordinator.run_round(&directory).await.unwrap();

        assert_eq!(report.hosts, 1);
        assert_eq!(report.succeeded, 1);
    }
}
