//! Reverse proxy in front of the supervised application.
//!
//! Requests are replayed against the child over loopback. Whenever the child
//! cannot be reached (not started yet, restarting, crashed) the proxy answers
//! with a small page that retries after a second instead of surfacing a
//! connection error.

use crate::error::SupervisorError;
use crate::reload;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use futures_util::StreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Largest request body replayed to the application.
pub const MAX_REQUEST_BODY: usize = 32 * 1024 * 1024;

/// Largest HTML body buffered for reload script injection.
const MAX_INJECTED_BODY: usize = 8 * 1024 * 1024;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const STARTING_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
  <meta charset="utf-8">
  <meta http-equiv="refresh" content="1">
  <title>Starting...</title>
  <style>
    body { font-family: system-ui, sans-serif; display: flex; align-items: center;
           justify-content: center; height: 100vh; margin: 0; color: #444; }
  </style>
</head>
<body>
  <p>Application is starting, this page will refresh automatically.</p>
</body>
</html>
"#;

/// Headers that only make sense for a single connection.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

#[derive(Debug, Error)]
enum ProxyFailure {
    #[error("failed to read request body: {0}")]
    RequestBody(axum::Error),
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),
}

/// HTTP forwarder to a loopback target.
#[derive(Debug, Clone)]
pub struct ReverseProxy {
    client: reqwest::Client,
    inject_reload_script: bool,
    inject_limit: usize,
}

impl ReverseProxy {
    /// Build a proxy. With `inject_reload_script`, HTML responses get the
    /// live reload client appended.
    pub fn new(inject_reload_script: bool) -> Result<Self, SupervisorError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(SupervisorError::HttpClient)?;

        Ok(Self {
            client,
            inject_reload_script,
            inject_limit: MAX_INJECTED_BODY,
        })
    }

    /// Largest HTML body buffered for injection; bigger ones are streamed
    /// through untouched.
    pub fn with_inject_limit(mut self, limit: usize) -> Self {
        self.inject_limit = limit;
        self
    }

    /// Forward `request` to `target`, or answer with the startup page.
    pub async fn forward(&self, target: Option<SocketAddr>, request: Request) -> Response {
        let Some(target) = target else {
            return starting_page();
        };

        match self.try_forward(target, request).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(%target, error = %e, "application unreachable");
                starting_page()
            }
        }
    }

    /// Whether anything answers HTTP on `target`.
    ///
    /// Any status counts; only transport failures mean "not ready".
    pub async fn probe(&self, target: SocketAddr) -> bool {
        self.client
            .get(format!("http://{target}/"))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    async fn try_forward(
        &self,
        target: SocketAddr,
        request: Request,
    ) -> Result<Response, ProxyFailure> {
        let (parts, body) = request.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("http://{target}{path}");

        let mut headers = strip_hop_by_hop(&parts.headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);
        if let Some(host) = parts.headers.get(header::HOST) {
            headers.insert("x-forwarded-host", host.clone());
        }
        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            if let Ok(value) = HeaderValue::from_str(&peer.ip().to_string()) {
                headers.insert("x-forwarded-for", value);
            }
        }

        let body = axum::body::to_bytes(body, MAX_REQUEST_BODY)
            .await
            .map_err(ProxyFailure::RequestBody)?;

        let mut upstream = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = upstream.status();
        let mut headers = strip_hop_by_hop(upstream.headers());

        if self.inject_reload_script && should_inject(&headers, self.inject_limit) {
            let mut content = Vec::new();
            while let Some(chunk) = upstream.chunk().await? {
                content.extend_from_slice(&chunk);
                if content.len() > self.inject_limit {
                    tracing::debug!(
                        limit = self.inject_limit,
                        "HTML response too large for reload injection, streaming"
                    );
                    let head = futures_util::stream::once(async move {
                        Ok::<_, reqwest::Error>(Bytes::from(content))
                    });
                    let body = Body::from_stream(head.chain(upstream.bytes_stream()));
                    return Ok(build_response(status, headers, body));
                }
            }
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("text/html");
            let injected = reload::inject_reload_script(&content, content_type);
            headers.remove(header::CONTENT_LENGTH);
            return Ok(build_response(status, headers, Body::from(injected)));
        }

        let body = Body::from_stream(upstream.bytes_stream());
        Ok(build_response(status, headers, body))
    }
}

/// The "application is starting" page: 502 with a one second retry.
pub fn starting_page() -> Response {
    (
        StatusCode::BAD_GATEWAY,
        [
            (header::RETRY_AFTER, "1"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        Html(STARTING_PAGE),
    )
        .into_response()
}

fn build_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn should_inject(headers: &HeaderMap, limit: usize) -> bool {
    let is_html = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(reload::is_html);
    let encoded = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| !v.eq_ignore_ascii_case("identity"));
    let small = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_none_or(|len| len <= limit);

    is_html && !encoded && small
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    // Headers listed in `Connection` are connection-scoped too.
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name)
            || name.as_str() == "keep-alive"
            || listed.iter().any(|l| l == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
