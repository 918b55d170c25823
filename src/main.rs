//! ClickHouse Metrics Exporter
//!
//! Scrapes every member of a ClickHouse installation and serves the result
//! to Prometheus.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         chi-exporter                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │    Watch     │───▶│   Registry   │───▶│  /metrics    │       │
//! │  │    Loop      │    │  (snapshot)  │    │  /chi        │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chi_exporter::adapters::{
    ExporterMetrics, HttpQueryExecutor, KubernetesDiscovery, PrometheusExposition,
};
use chi_exporter::config::{CliArgs, DiscoveryMode, ExporterConfig, LogFormat};
use chi_exporter::error::{Error, Result};
use chi_exporter::metrics::{
    HostDirectory, MetricsProber, MetricsRegistry, MetricsWatcher, ScrapeCoordinator, WatchConfig,
};
use chi_exporter::server::{self, AppState, Routes};

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = CliArgs::parse().into_config()?;

    init_logging(&config);

    info!("Starting chi-exporter {}", env!("CARGO_PKG_VERSION"));
    info!("  Cluster: {}", config.scope);
    info!("  Discovery: {:?}", config.discovery);
    info!("  Connection: {:?}", config.connection);
    info!("  Scrape interval: {:?}", config.scrape_interval);
    info!("  Round timeout: {:?}", config.round_timeout);

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let directory = Arc::new(build_directory(&config).await?);

    let executor = HttpQueryExecutor::new(Arc::new(config.connection.clone()))?;
    let prober = Arc::new(MetricsProber::new(executor));
    let registry = Arc::new(MetricsRegistry::new());
    let exporter_metrics = Arc::new(ExporterMetrics::new()?);

    let coordinator = ScrapeCoordinator::new(
        prober,
        Arc::clone(&registry),
        Arc::clone(&exporter_metrics),
    )
    .with_round_timeout(config.round_timeout);

    let watcher = MetricsWatcher::new(
        Arc::clone(&directory),
        Arc::new(coordinator),
        WatchConfig {
            scrape_interval: config.scrape_interval,
        },
        Arc::clone(&exporter_metrics),
    );

    let exposition = PrometheusExposition::new(
        config.scope.clone(),
        Arc::clone(&registry),
        exporter_metrics,
    );
    let state = Arc::new(AppState::new(directory, registry, exposition));

    // Start HTTP servers
    let mut servers = JoinSet::new();
    if config.single_listener() {
        servers.spawn(server::serve(
            config.metrics_endpoint,
            Arc::clone(&state),
            Routes::ALL,
            cancel.clone(),
        ));
    } else {
        servers.spawn(server::serve(
            config.metrics_endpoint,
            Arc::clone(&state),
            Routes::METRICS,
            cancel.clone(),
        ));
        servers.spawn(server::serve(
            config.chi_list_endpoint,
            Arc::clone(&state),
            Routes::CHI_LIST,
            cancel.clone(),
        ));
    }

    // Run the watch loop; a server failing to start stops everything.
    let outcome = tokio::select! {
        result = watcher.run(cancel.clone()) => result,
        Some(joined) = servers.join_next() => match joined {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!("HTTP server task failed: {}", e))),
        },
    };

    cancel.cancel();
    while let Some(joined) = servers.join_next().await {
        if let Ok(Err(e)) = joined {
            warn!("HTTP server error during shutdown: {}", e);
        }
    }

    if let Err(e) = &outcome {
        error!("Exporter stopped with error: {}", e);
    }
    info!("Exporter shutdown complete");
    outcome
}

async fn build_directory(config: &ExporterConfig) -> Result<HostDirectory> {
    let directory = match config.discovery {
        DiscoveryMode::Static => {
            HostDirectory::with_static_members(config.scope.clone(), config.addresses.clone())
        }
        DiscoveryMode::Kubernetes => {
            let client = Client::try_default().await.map_err(|e| {
                error!("Failed to create Kubernetes client: {}", e);
                Error::Internal(format!("Kubernetes client creation failed: {}", e))
            })?;
            info!("Connected to Kubernetes cluster");

            let source = KubernetesDiscovery::new(client)
                .with_cluster_domain(config.cluster_domain.as_str());
            HostDirectory::new(config.scope.clone(), Arc::new(source))
        }
    };

    Ok(directory.with_discovery_timeout(config.discovery_timeout))
}

// =============================================================================
// Signals
// =============================================================================

/// First SIGINT/SIGTERM cancels `cancel`; a second one exits immediately.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Failed to listen for shutdown signals: {}", e);
            return;
        }
        info!("Shutdown signal received");
        cancel.cancel();

        if shutdown_signal().await.is_ok() {
            warn!("Second shutdown signal received, exiting");
            std::process::exit(1);
        }
    });
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(config: &ExporterConfig) {
    let mut filter =
        EnvFilter::from_default_env().add_directive(config.log_level.as_level().into());
    for directive in ["hyper=warn", "kube=info", "reqwest=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    match config.log_format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init(),
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_ansi(false))
            .init(),
    }
}
