//! HTTP endpoints
//!
//! `/metrics` serves the Prometheus exposition, `/chi` the member directory
//! as JSON. Every listener also answers the health paths.
//!
//! | Path       | Body                                       |
//! |------------|--------------------------------------------|
//! | `/metrics` | text exposition of the registry snapshot   |
//! | `/chi`     | `[{"namespace","name","hostnames"}]`       |
//! | `/healthz` | `ok`                                       |
//! | `/livez`   | `ok`                                       |
//! | `/readyz`  | `ok` once a round has completed, else 503  |

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::{PrometheusExposition, CONTENT_TYPE as PROMETHEUS_CONTENT_TYPE};
use crate::error::{Error, Result};
use crate::metrics::{HostDirectory, MetricsRegistry};

pub const METRICS_PATH: &str = "/metrics";
pub const CHI_LIST_PATH: &str = "/chi";

/// Shared read-only view for request handlers.
pub struct AppState {
    directory: Arc<HostDirectory>,
    registry: Arc<MetricsRegistry>,
    exposition: PrometheusExposition,
}

impl AppState {
    pub fn new(
        directory: Arc<HostDirectory>,
        registry: Arc<MetricsRegistry>,
        exposition: PrometheusExposition,
    ) -> Self {
        Self {
            directory,
            registry,
            exposition,
        }
    }

    fn ready(&self) -> bool {
        self.registry.rounds_completed() > 0
    }
}

/// Which application paths a listener serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Routes {
    pub metrics: bool,
    pub chi_list: bool,
}

impl Routes {
    pub const ALL: Routes = Routes {
        metrics: true,
        chi_list: true,
    };
    pub const METRICS: Routes = Routes {
        metrics: true,
        chi_list: false,
    };
    pub const CHI_LIST: Routes = Routes {
        metrics: false,
        chi_list: true,
    };
}

// =============================================================================
// Server
// =============================================================================

/// Bind `addr` and serve until `cancel` fires.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<AppState>,
    routes: Routes,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Server(format!("Failed to bind {}: {}", addr, e)))?;

    info!(%addr, ?routes, "HTTP server listening");
    serve_listener(listener, state, routes, cancel).await
}

/// Serve connections from an already bound listener until `cancel` fires.
pub async fn serve_listener(
    listener: TcpListener,
    state: Arc<AppState>,
    routes: Routes,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("HTTP server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                continue;
            }
        };

        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = route(&state, routes, &req);
                async move { Ok::<_, Infallible>(response) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!(error = %e, "HTTP connection error");
            }
        });
    }
}

// =============================================================================
// Handlers
// =============================================================================

fn route<B>(state: &AppState, routes: Routes, req: &Request<B>) -> Response<Full<Bytes>> {
    let path = req.uri().path();
    let known = match path {
        METRICS_PATH => routes.metrics,
        CHI_LIST_PATH => routes.chi_list,
        "/healthz" | "/livez" | "/readyz" => true,
        _ => false,
    };
    if !known {
        return text(StatusCode::NOT_FOUND, "not found");
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    match path {
        METRICS_PATH => metrics(state),
        CHI_LIST_PATH => chi_list(state),
        "/readyz" if !state.ready() => text(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
        _ => text(StatusCode::OK, "ok"),
    }
}

fn metrics(state: &AppState) -> Response<Full<Bytes>> {
    match state.exposition.render() {
        Ok(buffer) => body(StatusCode::OK, PROMETHEUS_CONTENT_TYPE, buffer),
        Err(e) => {
            error!(error = %e, "Failed to render metrics");
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to render metrics")
        }
    }
}

fn chi_list(state: &AppState) -> Response<Full<Bytes>> {
    match serde_json::to_vec(&[state.directory.listing()]) {
        Ok(json) => body(StatusCode::OK, "application/json", json),
        Err(e) => {
            error!(error = %e, "Failed to encode member list");
            text(StatusCode::INTERNAL_SERVER_ERROR, "failed to encode member list")
        }
    }
}

fn text(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    body(status, "text/plain; charset=utf-8", message)
}

fn body(
    status: StatusCode,
    content_type: &'static str,
    content: impl Into<Bytes>,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(content.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::ExporterMetrics;
    use crate::domain::ports::{ClusterScope, HostAddress, MetricSample, Samples};
    use chrono::Utc;
    use http_body_util::BodyExt;

    fn state() -> Arc<AppState> {
        let scope = ClusterScope::new("analytics", "prod");
        let directory = Arc::new(HostDirectory::with_static_members(
            scope.clone(),
            ["ch-0", "ch-1"],
        ));
        let registry = Arc::new(MetricsRegistry::new());
        let exposition = PrometheusExposition::new(
            scope,
            Arc::clone(&registry),
            Arc::new(ExporterMetrics::new().unwrap()),
        );
        Arc::new(AppState::new(directory, registry, exposition))
    }

    fn get(path: &str) -> Request<()> {
        Request::builder().uri(path).body(()).unwrap()
    }

    async fn body_text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_paths() {
        let state = state();
        for path in ["/healthz", "/livez"] {
            let response = route(&state, Routes::ALL, &get(path));
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(body_text(response).await, "ok");
        }
    }

    #[tokio::test]
    async fn test_readyz_waits_for_first_round() {
        let state = state();
        let response = route(&state, Routes::ALL, &get("/readyz"));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let update = state.registry.begin_update();
        state.registry.commit_round(update).unwrap();

        let response = route(&state, Routes::ALL, &get("/readyz"));
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_chi_list_json() {
        let state = state();
        let response = route(&state, Routes::ALL, &get("/chi"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/json");

        let json: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json[0]["namespace"], "analytics");
        assert_eq!(json[0]["name"], "prod");
        assert_eq!(json[0]["hostnames"], serde_json::json!(["ch-0", "ch-1"]));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let state = state();
        let mut samples = Samples::new();
        samples.insert("chi_clickhouse_metric_Query".to_string(), MetricSample::gauge(2.0));
        state
            .registry
            .record_success(HostAddress::new("ch-0"), samples, Utc::now())
            .unwrap();

        let response = route(&state, Routes::ALL, &get("/metrics"));
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], PROMETHEUS_CONTENT_TYPE);
        let expected = concat!(
            "chi_clickhouse_metric_Query",
            "{chi=\"prod\",hostname=\"ch-0\",namespace=\"analytics\"} 2"
        );
        assert!(body_text(response).await.contains(expected));
    }

    #[tokio::test]
    async fn test_routes_limit_paths() {
        let state = state();
        assert_eq!(
            route(&state, Routes::METRICS, &get("/chi")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&state, Routes::CHI_LIST, &get("/metrics")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            route(&state, Routes::CHI_LIST, &get("/healthz")).status(),
            StatusCode::OK
        );
        assert_eq!(
            route(&state, Routes::ALL, &get("/nope")).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_non_get_is_rejected() {
        let state = state();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/chi")
            .body(())
            .unwrap();

        let response = route(&state, Routes::ALL, &request);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET, HEAD");
    }

    #[tokio::test]
    async fn test_serve_listener_until_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve_listener(listener, state(), Routes::ALL, cancel.clone()));

        let body = reqwest::get(format!("http://{}/healthz", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok");

        cancel.cancel();
        server.await.unwrap().unwrap();
    }
}
