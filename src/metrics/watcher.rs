//! Watch Loop
//!
//! Drives the exporter: refresh the directory, run one scrape round, sleep
//! until the next tick. Repeats until cancelled.
//!
//! ```text
//!   Idle ─► Refreshing ─► Scraping ─► Sleeping ─┐
//!               ▲                               │
//!               └───────────────────────────────┘
//!   any state ──cancel──► Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::adapters::ExporterMetrics;
use crate::error::{Error, Result};
use crate::metrics::coordinator::ScrapeCoordinator;
use crate::metrics::directory::{HostDirectory, MembershipChange};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the watch loop
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Time between cycle starts
    pub scrape_interval: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            scrape_interval: Duration::from_secs(30),
        }
    }
}

/// Where the loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchState {
    Idle,
    Refreshing,
    Scraping,
    Sleeping,
    Stopped,
}

// =============================================================================
// Watcher
// =============================================================================

/// Periodic refresh-and-scrape loop over one cluster.
pub struct MetricsWatcher {
    directory: Arc<HostDirectory>,
    coordinator: Arc<ScrapeCoordinator>,
    exporter_metrics: Arc<ExporterMetrics>,
    config: WatchConfig,
    state: watch::Sender<WatchState>,
}

impl MetricsWatcher {
    pub fn new(
        directory: Arc<HostDirectory>,
        coordinator: Arc<ScrapeCoordinator>,
        config: WatchConfig,
        exporter_metrics: Arc<ExporterMetrics>,
    ) -> Self {
        let (state, _) = watch::channel(WatchState::Idle);
        Self {
            directory,
            coordinator,
            exporter_metrics,
            config,
            state,
        }
    }

    /// Receive state transitions.
    pub fn subscribe(&self) -> watch::Receiver<WatchState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Run until `cancel` fires.
    ///
    /// Discovery and scrape failures are logged and the loop continues.
    /// Returns an error only on registry corruption. A round interrupted by
    /// cancellation is dropped without committing anything.
    #[instrument(skip(self, cancel), fields(scope = %self.directory.scope()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            interval = ?self.config.scrape_interval,
            source = self.directory.source_name(),
            "Starting watch loop"
        );

        let result = self.run_cycles(&cancel).await;
        self.state.send_replace(WatchState::Stopped);

        match &result {
            Ok(()) => info!("Watch loop stopped"),
            Err(e) => error!(error = %e, "Watch loop aborted"),
        }
        result
    }

    async fn run_cycles(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            let cycle_start = Instant::now();

            self.state.send_replace(WatchState::Refreshing);
            let refreshed = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                refreshed = self.directory.refresh() => refreshed,
            };
            match refreshed {
                Ok(change) => log_membership_change(&change),
                Err(e) => {
                    self.exporter_metrics.discovery_failed();
                    warn!(error = %e, "Discovery failed, keeping last known members");
                }
            }

            self.state.send_replace(WatchState::Scraping);
            let round = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                round = self.coordinator.run_round(&self.directory) => round,
            };
            match round {
                Ok(report) => debug!(round = report.round, hosts = report.hosts, "Round merged"),
                Err(e @ Error::RegistryCorruption(_)) => return Err(e),
                Err(e) => warn!(error = %e, "Scrape round failed"),
            }

            self.state.send_replace(WatchState::Sleeping);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = sleep_until(cycle_start + self.config.scrape_interval) => {}
            }
        }
    }
}

fn log_membership_change(change: &MembershipChange) {
    if change.is_unchanged() {
        return;
    }
    let added: Vec<&str> = change.added.iter().map(|h| h.as_str()).collect();
    let removed: Vec<&str> = change.removed.iter().map(|h| h.as_str()).collect();
    info!(
        ?added,
        ?removed,
        members = change.members.len(),
        "Cluster membership changed"
    );
}
