//! Command-line and environment configuration
//!
//! `CliArgs` is parsed by clap and validated into an `ExporterConfig` before
//! any component is built.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::Level;

use crate::domain::ports::{ClusterScope, ConnectionParams, HostAddress, Scheme};
use crate::error::{Error, Result};

// =============================================================================
// CLI Arguments
// =============================================================================

/// How cluster members are discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DiscoveryMode {
    /// Fixed list from `--address`
    #[default]
    Static,
    /// Running Pods labelled with the installation name
    Kubernetes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_level(&self) -> Level {
        match self {
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error | LogLevel::Fatal => Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    #[default]
    Json,
    Text,
}

/// ClickHouse cluster metrics exporter for Prometheus
#[derive(Parser, Debug, Clone)]
#[command(name = "chi-exporter", author, version, about, long_about = None)]
pub struct CliArgs {
    /// ClickHouse installation name (defaults to the machine hostname)
    #[arg(long, env = "HOSTNAME")]
    pub chi_name: Option<String>,

    /// Namespace label for exported metrics
    #[arg(long, env = "NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Address serving /metrics
    #[arg(long, env = "METRICS_ENDPOINT", default_value = ":8888")]
    pub metrics_endpoint: String,

    /// Address serving /chi
    #[arg(long, env = "CHI_LIST_ENDPOINT", default_value = ":8888")]
    pub chi_list_endpoint: String,

    /// ClickHouse HTTP scheme (http or https)
    #[arg(long, env = "CH_SCHEME", default_value = "http", value_parser = parse_scheme)]
    pub scheme: Scheme,

    /// ClickHouse username
    #[arg(long, env = "CH_USERNAME", default_value = "default")]
    pub username: String,

    /// ClickHouse password
    #[arg(long, env = "CH_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// ClickHouse HTTP port
    #[arg(long, env = "CH_PORT", default_value = "8123")]
    pub port: u16,

    /// ClickHouse host; repeat or comma-separate for several
    #[arg(long = "address", default_value = "127.0.0.1", value_delimiter = ',')]
    pub addresses: Vec<String>,

    /// Path to a PEM root CA for https
    #[arg(long, env = "CH_ROOT_CA")]
    pub root_ca: Option<PathBuf>,

    /// Connection establishment timeout
    #[arg(
        long,
        env = "CH_CONNECT_TIMEOUT",
        default_value = "2s",
        value_parser = parse_duration_arg
    )]
    pub connect_timeout: Duration,

    /// Per-query timeout
    #[arg(long, env = "CH_QUERY_TIMEOUT", default_value = "5s", value_parser = parse_duration_arg)]
    pub query_timeout: Duration,

    /// Member discovery source
    #[arg(long, env = "CHI_DISCOVERY", value_enum, default_value_t = DiscoveryMode::Static)]
    pub discovery: DiscoveryMode,

    /// Cluster DNS domain used for Kubernetes member addresses
    #[arg(long, env = "CLUSTER_DOMAIN", default_value = "cluster.local")]
    pub cluster_domain: String,

    /// Time between scrape cycle starts
    #[arg(long, env = "SCRAPE_INTERVAL", default_value = "30s", value_parser = parse_duration_arg)]
    pub scrape_interval: Duration,

    /// Wall-clock bound on one scrape round
    #[arg(long, env = "ROUND_TIMEOUT", default_value = "25s", value_parser = parse_duration_arg)]
    pub round_timeout: Duration,

    /// Bound on one discovery call
    #[arg(long, env = "DISCOVERY_TIMEOUT", default_value = "5s", value_parser = parse_duration_arg)]
    pub discovery_timeout: Duration,

    /// Minimum log severity
    #[arg(long, env = "LOG_LEVEL", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

fn parse_scheme(s: &str) -> std::result::Result<Scheme, String> {
    s.parse::<Scheme>().map_err(|e| e.to_string())
}

fn parse_duration_arg(s: &str) -> std::result::Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

// =============================================================================
// Validated Configuration
// =============================================================================

/// Fully validated exporter configuration.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub scope: ClusterScope,
    pub connection: ConnectionParams,
    pub discovery: DiscoveryMode,
    pub addresses: Vec<HostAddress>,
    pub cluster_domain: String,
    pub metrics_endpoint: SocketAddr,
    pub chi_list_endpoint: SocketAddr,
    pub scrape_interval: Duration,
    pub round_timeout: Duration,
    pub discovery_timeout: Duration,
    pub log_level: LogLevel,
    pub log_format: LogFormat,
}

impl ExporterConfig {
    /// Whether both endpoints share one listener.
    pub fn single_listener(&self) -> bool {
        self.metrics_endpoint == self.chi_list_endpoint
    }
}

impl CliArgs {
    /// Validate arguments into an `ExporterConfig`.
    pub fn into_config(self) -> Result<ExporterConfig> {
        let chi_name = match self.chi_name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => machine_hostname(),
        };
        if self.namespace.trim().is_empty() {
            return Err(Error::Config("namespace must not be empty".into()));
        }

        let addresses: Vec<HostAddress> = self
            .addresses
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(HostAddress::from)
            .collect();
        if self.discovery == DiscoveryMode::Static && addresses.is_empty() {
            return Err(Error::Config(
                "static discovery needs at least one --address".into(),
            ));
        }

        for (flag, value) in [
            ("scrape-interval", self.scrape_interval),
            ("round-timeout", self.round_timeout),
            ("discovery-timeout", self.discovery_timeout),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("--{} must be non-zero", flag)));
            }
        }

        let connection = ConnectionParams::new(
            self.scheme,
            self.username,
            self.password,
            self.root_ca,
            self.port,
            self.connect_timeout,
            self.query_timeout,
        )?;

        Ok(ExporterConfig {
            scope: ClusterScope::new(self.namespace.trim(), chi_name),
            connection,
            discovery: self.discovery,
            addresses,
            cluster_domain: self.cluster_domain,
            metrics_endpoint: parse_listen_addr(&self.metrics_endpoint)?,
            chi_list_endpoint: parse_listen_addr(&self.chi_list_endpoint)?,
            scrape_interval: self.scrape_interval,
            round_timeout: self.round_timeout,
            discovery_timeout: self.discovery_timeout,
            log_level: self.log_level,
            log_format: self.log_format,
        })
    }
}

fn machine_hostname() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().trim().to_string();
    if hostname.is_empty() {
        "localhost".to_string()
    } else {
        hostname
    }
}

// =============================================================================
// Parsing Helpers
// =============================================================================

/// Parse a listen address. `:port` binds all interfaces.
pub fn parse_listen_addr(s: &str) -> Result<SocketAddr> {
    let s = s.trim();
    let full = if s.starts_with(':') {
        format!("0.0.0.0{}", s)
    } else {
        s.to_string()
    };
    full.parse()
        .map_err(|e| Error::Config(format!("invalid listen address '{}': {}", s, e)))
}

/// Parse a duration like `2s`, `500ms`, `1m30s` or `1.5h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::DurationParse("empty duration string".to_string()));
    }

    let mut total_nanos: u128 = 0;
    let mut rest = s;

    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let (num, tail) = rest.split_at(num_end);
        if num.is_empty() {
            return Err(Error::DurationParse(format!(
                "expected number in duration: {}",
                s
            )));
        }

        let unit_end = tail
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(tail.len());
        let (unit, next) = tail.split_at(unit_end);

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "" | "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3600 * 1_000_000_000,
            other => {
                return Err(Error::DurationParse(format!(
                    "unknown duration unit '{}' in {}",
                    other, s
                )))
            }
        };

        let nanos = scaled_nanos(num, unit_nanos)
            .ok_or_else(|| Error::DurationParse(format!("invalid number in duration: {}", s)))?;
        total_nanos = total_nanos
            .checked_add(nanos)
            .ok_or_else(|| Error::DurationParse(format!("duration overflows: {}", s)))?;
        rest = next;
    }

    let secs = u64::try_from(total_nanos / 1_000_000_000)
        .map_err(|_| Error::DurationParse(format!("duration overflows: {}", s)))?;
    Ok(Duration::new(secs, (total_nanos % 1_000_000_000) as u32))
}

/// `num` (digits with an optional fraction) times `unit_nanos`, exactly.
fn scaled_nanos(num: &str, unit_nanos: u128) -> Option<u128> {
    let (int, frac) = num.split_once('.').unwrap_or((num, ""));
    if int.is_empty() && frac.is_empty() {
        return None;
    }

    let int: u128 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let mut nanos = int.checked_mul(unit_nanos)?;
    let mut scale = unit_nanos;
    for c in frac.chars() {
        scale /= 10;
        nanos = nanos.checked_add(c.to_digit(10)? as u128 * scale)?;
    }
    Some(nanos)
}
