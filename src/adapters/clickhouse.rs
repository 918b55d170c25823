//! ClickHouse HTTP Query Adapter
//!
//! Implements the `QueryExecutor` port against the ClickHouse HTTP interface.
//! Queries are sent as `GET` requests, which ClickHouse always runs in
//! read-only mode, and results are requested as `TabSeparated`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::{debug, instrument};

use crate::domain::ports::{ConnectionParams, HostAddress, QueryExecutor, Row};
use crate::error::{Error, ProbeError, ProbeErrorKind, Result};

/// Header carrying the ClickHouse exception code on failed requests.
const EXCEPTION_CODE_HEADER: &str = "X-ClickHouse-Exception-Code";

/// ClickHouse error codes meaning the credentials were rejected.
/// 192 UNKNOWN_USER, 193 WRONG_PASSWORD, 516 AUTHENTICATION_FAILED
const AUTH_ERROR_CODES: [u32; 3] = [192, 193, 516];

/// Query executor speaking the ClickHouse HTTP protocol.
#[derive(Clone)]
pub struct HttpQueryExecutor {
    params: Arc<ConnectionParams>,
    client: Client,
    request_timeout: Duration,
}

impl HttpQueryExecutor {
    /// Build an executor from connection parameters.
    ///
    /// Loads the root CA, if configured, into the client's trust store.
    pub fn new(params: Arc<ConnectionParams>) -> Result<Self> {
        let mut builder = Client::builder().connect_timeout(params.connect_timeout());

        if let Some(path) = params.root_ca() {
            let pem = std::fs::read(path)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                Error::HttpClient(format!("invalid root CA {}: {}", path.display(), e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| Error::HttpClient(format!("Failed to create HTTP client: {}", e)))?;

        // Connecting is bounded by the client; each request by the query timeout.
        let request_timeout = params.query_timeout();

        Ok(Self {
            params,
            client,
            request_timeout,
        })
    }

    /// Connection parameters this executor was built with.
    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    fn query_url(&self, host: &HostAddress, sql: &str) -> String {
        let statement = format!("{} FORMAT TabSeparated", sql.trim());
        format!(
            "{}?query={}",
            self.params.base_url(host),
            urlencoding::encode(&statement)
        )
    }
}

impl std::fmt::Debug for HttpQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpQueryExecutor")
            .field("params", &self.params)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
impl QueryExecutor for HttpQueryExecutor {
    #[instrument(skip(self, host, sql), fields(host = %host))]
    async fn query(
        &self,
        host: &HostAddress,
        sql: &str,
    ) -> std::result::Result<Vec<Row>, ProbeError> {
        let url = self.query_url(host, sql);

        let response = self
            .client
            .get(&url)
            .header("X-ClickHouse-User", self.params.username())
            .header("X-ClickHouse-Key", self.params.password())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        let exception_code = response
            .headers()
            .get(EXCEPTION_CODE_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u32>().ok());

        if is_auth_failure(status, exception_code) {
            return Err(ProbeError::new(
                ProbeErrorKind::AuthFailed,
                format!("credentials rejected (HTTP {})", status.as_u16()),
            ));
        }

        let body = response.bytes().await.map_err(classify_transport_error)?;

        if !status.is_success() {
            let text = String::from_utf8_lossy(&body);
            let first_line = text.lines().next().unwrap_or_default();
            return Err(ProbeError::new(
                ProbeErrorKind::QueryFailed,
                format!("HTTP {}: {}", status.as_u16(), first_line),
            ));
        }

        let text = std::str::from_utf8(&body)
            .map_err(|e| ProbeError::malformed(format!("response is not UTF-8: {}", e)))?;

        let rows = parse_tab_separated(text)?;
        debug!(rows = rows.len(), "Query returned");
        Ok(rows)
    }
}

// =============================================================================
// Classification
// =============================================================================

fn classify_transport_error(e: reqwest::Error) -> ProbeError {
    let kind = if e.is_connect() {
        ProbeErrorKind::ConnectFailed
    } else if e.is_timeout() {
        ProbeErrorKind::Timeout
    } else if e.is_decode() || e.is_body() {
        ProbeErrorKind::MalformedResponse
    } else {
        ProbeErrorKind::QueryFailed
    };
    ProbeError::new(kind, e.to_string())
}

fn is_auth_failure(status: StatusCode, exception_code: Option<u32>) -> bool {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return true;
    }
    exception_code.is_some_and(|code| AUTH_ERROR_CODES.contains(&code))
}

// =============================================================================
// TabSeparated Parsing
// =============================================================================

/// Split a `TabSeparated` body into rows of unescaped fields.
///
/// ClickHouse may append an exception after partial output once streaming
/// has started; such a line fails the whole query.
pub fn parse_tab_separated(body: &str) -> std::result::Result<Vec<Row>, ProbeError> {
    let mut rows = Vec::new();

    for line in body.lines() {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("Code: ") && line.contains("Exception") {
            return Err(ProbeError::new(ProbeErrorKind::QueryFailed, line.to_string()));
        }
        rows.push(line.split('\t').map(unescape_field).collect());
    }

    Ok(rows)
}

fn unescape_field(field: &str) -> String {
    if !field.contains('\\') {
        return field.to_string();
    }

    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
