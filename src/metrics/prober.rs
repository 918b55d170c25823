//! Per-Host Prober
//!
//! Runs the fixed set of introspection queries against one host and turns
//! the tabular answers into normalized samples.

use async_trait::async_trait;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument};

use crate::domain::ports::{
    HostAddress, MetricKind, MetricSample, ProbeResult, Prober, QueryExecutor, Row, Samples,
};
use crate::error::ProbeError;

/// Prefix for gauges read from `system.metrics` and friends.
pub const METRIC_PREFIX: &str = "chi_clickhouse_metric_";

/// Prefix for counters read from `system.events`.
pub const EVENT_PREFIX: &str = "chi_clickhouse_event_";

// =============================================================================
// Introspection Queries
// =============================================================================

/// One read-only query and how to interpret its rows.
///
/// Every query yields `name, value, description` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntrospectionQuery {
    /// Table the query reads, for diagnostics
    pub source: &'static str,
    pub sql: &'static str,
    pub prefix: &'static str,
    pub kind: MetricKind,
}

/// Queries issued on every probe, in order.
pub const DEFAULT_QUERIES: [IntrospectionQuery; 4] = [
    IntrospectionQuery {
        source: "system.metrics",
        sql: "SELECT metric, toString(value), description FROM system.metrics",
        prefix: METRIC_PREFIX,
        kind: MetricKind::Gauge,
    },
    IntrospectionQuery {
        source: "system.events",
        sql: "SELECT event, toString(value), description FROM system.events",
        prefix: EVENT_PREFIX,
        kind: MetricKind::Counter,
    },
    IntrospectionQuery {
        source: "system.asynchronous_metrics",
        sql: "SELECT metric, toString(value), '' FROM system.asynchronous_metrics",
        prefix: METRIC_PREFIX,
        kind: MetricKind::Gauge,
    },
    IntrospectionQuery {
        source: "system.parts",
        sql: concat!(
            "SELECT 'DiskDataBytes', toString(sum(bytes_on_disk)), ",
            "'Total data size of active parts' FROM system.parts WHERE active ",
            "UNION ALL SELECT 'MemoryPrimaryKeyBytesAllocated', ",
            "toString(sum(primary_key_bytes_in_memory_allocated)), ",
            "'Memory allocated for primary keys' FROM system.parts WHERE active ",
            "UNION ALL SELECT 'ActiveParts', toString(count()), ",
            "'Number of active parts' FROM system.parts WHERE active ",
            "UNION ALL SELECT 'ActiveRows', toString(sum(rows)), ",
            "'Number of rows in active parts' FROM system.parts WHERE active",
        ),
        prefix: METRIC_PREFIX,
        kind: MetricKind::Gauge,
    },
];

// =============================================================================
// Name Normalization
// =============================================================================

/// Map a raw name into the Prometheus metric name alphabet.
///
/// Characters outside `[a-zA-Z0-9_:]` become `_`; a leading digit gets a
/// `_` prefix.
pub fn normalize_metric_name(raw: &str) -> String {
    let mut name: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        name.insert(0, '_');
    }
    name
}

/// Fold the rows of one query into `samples`.
///
/// Returns the number of rows skipped. A non-empty answer with no usable row
/// at all is a malformed response.
pub fn collect_rows(
    query: &IntrospectionQuery,
    rows: Vec<Row>,
    samples: &mut Samples,
) -> std::result::Result<usize, ProbeError> {
    let total = rows.len();
    let mut skipped = 0;

    for row in rows {
        let (raw_name, raw_value) = match (row.first(), row.get(1)) {
            (Some(name), Some(value)) if !name.is_empty() => (name, value),
            _ => {
                skipped += 1;
                continue;
            }
        };

        let value = match raw_value.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => v,
            _ => {
                skipped += 1;
                continue;
            }
        };

        // Counters can only be exported non-negative.
        if query.kind == MetricKind::Counter && value < 0.0 {
            skipped += 1;
            continue;
        }

        let name = normalize_metric_name(&format!("{}{}", query.prefix, raw_name));
        let help = row.get(2).cloned().unwrap_or_default();

        samples.entry(name).or_insert(MetricSample {
            value,
            kind: query.kind,
            help,
        });
    }

    if total > 0 && skipped == total {
        return Err(ProbeError::malformed(format!(
            "no parseable rows in {} ({} rows)",
            query.source, total
        )));
    }

    Ok(skipped)
}

// =============================================================================
// Metrics Prober
// =============================================================================

/// Prober that collects the default introspection queries through an
/// executor.
pub struct MetricsProber<E> {
    executor: E,
    queries: Vec<IntrospectionQuery>,
}

impl<E: QueryExecutor> MetricsProber<E> {
    /// Create a prober issuing the default queries.
    pub fn new(executor: E) -> Self {
        Self::with_queries(executor, DEFAULT_QUERIES.to_vec())
    }

    /// Create a prober issuing a custom query set.
    pub fn with_queries(executor: E, queries: Vec<IntrospectionQuery>) -> Self {
        Self { executor, queries }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn queries(&self) -> &[IntrospectionQuery] {
        &self.queries
    }
}

impl<E> std::fmt::Debug for MetricsProber<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsProber")
            .field("queries", &self.queries.len())
            .finish()
    }
}

#[async_trait]
impl<E: QueryExecutor> Prober for MetricsProber<E> {
    #[instrument(skip(self, host, deadline), fields(host = %host))]
    async fn probe(&self, host: &HostAddress, deadline: Instant) -> ProbeResult {
        let mut samples = Samples::new();
        let mut skipped_rows = 0;

        for query in &self.queries {
            let rows = match timeout_at(deadline, self.executor.query(host, query.sql)).await {
                Ok(Ok(rows)) => rows,
                Ok(Err(e)) => {
                    debug!(source = query.source, error = %e, "Query failed");
                    return ProbeResult::failure(host.clone(), e);
                }
                Err(_) => {
                    return ProbeResult::failure(
                        host.clone(),
                        ProbeError::timeout(format!("deadline exceeded querying {}", query.source)),
                    );
                }
            };

            match collect_rows(query, rows, &mut samples) {
                Ok(skipped) => skipped_rows += skipped,
                Err(e) => return ProbeResult::failure(host.clone(), e),
            }
        }

        if skipped_rows > 0 {
            debug!(skipped_rows, "Skipped unparseable rows");
        }

        ProbeResult::success(host.clone(), samples, skipped_rows)
    }
}
