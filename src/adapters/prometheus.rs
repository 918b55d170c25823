//! Prometheus Exposition Adapter
//!
//! Renders the registry snapshot in the Prometheus text format and owns the
//! exporter's own operational metrics.
//!
//! Host series are rebuilt from the snapshot on every scrape into a
//! throwaway `Registry`, so hosts and metrics that disappear from the
//! snapshot disappear from the output as well.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::{
    CounterVec, Encoder, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge,
    Opts, Registry, TextEncoder,
};
use tracing::warn;

use crate::domain::ports::{ClusterScope, MetricKind};
use crate::error::{ProbeErrorKind, Result};
use crate::metrics::MetricsRegistry;

/// Labels carried by every host series.
pub const HOST_LABELS: [&str; 3] = ["chi", "namespace", "hostname"];

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

const ROUND_DURATION_BUCKETS: [f64; 10] = [0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 60.0];

// =============================================================================
// Exporter Self-Metrics
// =============================================================================

/// Operational metrics of the exporter itself, prefixed `chi_exporter_`.
pub struct ExporterMetrics {
    registry: Registry,
    rounds_total: IntCounter,
    round_duration: Histogram,
    probe_failures: IntCounterVec,
    skipped_rows: IntCounter,
    discovery_failures: IntCounter,
    members: IntGauge,
}

impl ExporterMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("chi_exporter".to_string()), None)?;

        let rounds_total = IntCounter::with_opts(Opts::new(
            "rounds_total",
            "Scrape rounds completed",
        ))?;
        let round_duration = Histogram::with_opts(
            HistogramOpts::new("round_duration_seconds", "Wall time of one scrape round")
                .buckets(ROUND_DURATION_BUCKETS.to_vec()),
        )?;
        let probe_failures = IntCounterVec::new(
            Opts::new("probe_failures_total", "Failed host probes grouped by kind"),
            &["kind"],
        )?;
        let skipped_rows = IntCounter::with_opts(Opts::new(
            "skipped_rows_total",
            "Introspection rows skipped as unparseable",
        ))?;
        let discovery_failures = IntCounter::with_opts(Opts::new(
            "discovery_failures_total",
            "Failed member discovery attempts",
        ))?;
        let members = IntGauge::with_opts(Opts::new(
            "members",
            "Cluster members in the current directory snapshot",
        ))?;

        registry.register(Box::new(rounds_total.clone()))?;
        registry.register(Box::new(round_duration.clone()))?;
        registry.register(Box::new(probe_failures.clone()))?;
        registry.register(Box::new(skipped_rows.clone()))?;
        registry.register(Box::new(discovery_failures.clone()))?;
        registry.register(Box::new(members.clone()))?;

        // Expose every kind from the start so rate() works on first failure.
        for kind in ProbeErrorKind::ALL {
            probe_failures.with_label_values(&[kind.as_str()]);
        }

        Ok(Self {
            registry,
            rounds_total,
            round_duration,
            probe_failures,
            skipped_rows,
            discovery_failures,
            members,
        })
    }

    pub fn observe_round(&self, elapsed: Duration, skipped_rows: usize) {
        self.rounds_total.inc();
        self.round_duration.observe(elapsed.as_secs_f64());
        self.skipped_rows.inc_by(skipped_rows as u64);
    }

    pub fn probe_failed(&self, kind: ProbeErrorKind) {
        self.probe_failures.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn discovery_failed(&self) {
        self.discovery_failures.inc();
    }

    pub fn set_members(&self, count: usize) {
        self.members.set(count as i64);
    }

    pub fn rounds_total(&self) -> u64 {
        self.rounds_total.get()
    }

    pub fn probe_failures(&self, kind: ProbeErrorKind) -> u64 {
        self.probe_failures.with_label_values(&[kind.as_str()]).get()
    }

    pub fn discovery_failures(&self) -> u64 {
        self.discovery_failures.get()
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

impl std::fmt::Debug for ExporterMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExporterMetrics")
            .field("rounds_total", &self.rounds_total.get())
            .field("discovery_failures", &self.discovery_failures.get())
            .finish()
    }
}

// =============================================================================
// Exposition
// =============================================================================

enum Family {
    Gauge(GaugeVec),
    Counter(CounterVec),
}

/// Renders the registry for `GET /metrics`.
#[derive(Clone)]
pub struct PrometheusExposition {
    scope: ClusterScope,
    registry: Arc<MetricsRegistry>,
    exporter_metrics: Arc<ExporterMetrics>,
}

impl PrometheusExposition {
    pub fn new(
        scope: ClusterScope,
        registry: Arc<MetricsRegistry>,
        exporter_metrics: Arc<ExporterMetrics>,
    ) -> Self {
        Self {
            scope,
            registry,
            exporter_metrics,
        }
    }

    /// Encode the current snapshot plus exporter self-metrics.
    ///
    /// Down hosts never make this fail; they show up through the host
    /// metadata series instead.
    pub fn render(&self) -> Result<Vec<u8>> {
        let snapshot = self.registry.current();
        let scratch = Registry::new();

        let host_up = register_gauge(
            &scratch,
            "chi_clickhouse_host_up",
            "Whether the last probe of the host succeeded",
            &HOST_LABELS,
        )?;
        let host_stale = register_gauge(
            &scratch,
            "chi_clickhouse_host_stale",
            "Whether the host's samples are from an earlier round",
            &HOST_LABELS,
        )?;
        let last_success = register_gauge(
            &scratch,
            "chi_clickhouse_host_last_success_timestamp_seconds",
            "Unix time of the host's last successful probe",
            &HOST_LABELS,
        )?;
        let last_error = register_gauge(
            &scratch,
            "chi_clickhouse_host_last_error",
            "Kind of the host's last probe failure",
            &["chi", "namespace", "hostname", "kind"],
        )?;

        let mut families: BTreeMap<String, Family> = BTreeMap::new();

        for (host, record) in &snapshot.hosts {
            let labels = [
                self.scope.cluster_name.as_str(),
                self.scope.namespace.as_str(),
                host.as_str(),
            ];

            let up = !record.stale && record.last_error.is_none();
            host_up.with_label_values(&labels).set(if up { 1.0 } else { 0.0 });
            host_stale
                .with_label_values(&labels)
                .set(if record.stale { 1.0 } else { 0.0 });
            if let Some(at) = record.last_success {
                last_success
                    .with_label_values(&labels)
                    .set(at.timestamp_millis() as f64 / 1000.0);
            }
            if let Some(kind) = record.last_error {
                last_error
                    .with_label_values(&[labels[0], labels[1], labels[2], kind.as_str()])
                    .set(1.0);
            }

            for (name, sample) in &record.samples {
                if !families.contains_key(name) {
                    match new_family(&scratch, name, sample.kind, &sample.help) {
                        Ok(family) => {
                            families.insert(name.clone(), family);
                        }
                        Err(e) => {
                            warn!(metric = %name, error = %e, "Skipping unregistrable metric");
                            continue;
                        }
                    }
                }

                match families.get(name) {
                    Some(Family::Gauge(vec)) => vec.with_label_values(&labels).set(sample.value),
                    Some(Family::Counter(vec)) if sample.value >= 0.0 => {
                        vec.with_label_values(&labels).inc_by(sample.value)
                    }
                    _ => {}
                }
            }
        }

        let mut metric_families = scratch.gather();
        metric_families.extend(self.exporter_metrics.gather());

        let mut buffer = Vec::new();
        TextEncoder::new().encode(&metric_families, &mut buffer)?;
        Ok(buffer)
    }
}

fn register_gauge(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn new_family(registry: &Registry, name: &str, kind: MetricKind, help: &str) -> Result<Family> {
    let help = if help.trim().is_empty() {
        format!("ClickHouse {}", name)
    } else {
        help.to_string()
    };
    let opts = Opts::new(name, help);

    let family = match kind {
        MetricKind::Gauge => {
            let vec = GaugeVec::new(opts, &HOST_LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Family::Gauge(vec)
        }
        MetricKind::Counter => {
            let vec = CounterVec::new(opts, &HOST_LABELS)?;
            registry.register(Box::new(vec.clone()))?;
            Family::Counter(vec)
        }
    };
    Ok(family)
}
