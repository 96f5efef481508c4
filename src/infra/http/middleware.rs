use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{application::error::ErrorReport, cache::RENDER_CACHE_HEADER};

pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
}

/// Tag the request with a fresh id and echo it on the response.
pub async fn set_request_context(mut request: Request<Body>, next: Next) -> Response {
    let ctx = RequestContext {
        request_id: Uuid::new_v4().to_string(),
    };
    request.extensions_mut().insert(ctx.clone());

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response.extensions_mut().insert(ctx);
    response
}

struct RequestLine {
    method: Method,
    path: String,
    route: String,
    request_id: String,
    started: Instant,
}

impl RequestLine {
    fn capture(request: &Request<Body>) -> Self {
        let extensions = request.extensions();
        Self {
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            route: extensions
                .get::<MatchedPath>()
                .map(|matched| matched.as_str().to_string())
                .unwrap_or_default(),
            request_id: extensions
                .get::<RequestContext>()
                .map(|ctx| ctx.request_id.clone())
                .unwrap_or_default(),
            started: Instant::now(),
        }
    }
}

/// Log every response: failures with their error chain, pages with the cache outcome.
pub async fn log_responses(request: Request<Body>, next: Next) -> Response {
    let line = RequestLine::capture(&request);
    let mut response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = line.started.elapsed().as_millis() as u64;

    if status.is_client_error() || status.is_server_error() {
        let report = response.extensions_mut().remove::<ErrorReport>();
        log_failure(&line, status, elapsed_ms, report);
        return response;
    }

    let outcome = response
        .headers()
        .get(RENDER_CACHE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("none");
    debug!(
        target = "rendercache::http::response",
        status = status.as_u16(),
        method = %line.method,
        path = %line.path,
        route = %line.route,
        outcome,
        elapsed_ms,
        request_id = %line.request_id,
        "page served",
    );
    response
}

fn log_failure(line: &RequestLine, status: StatusCode, elapsed_ms: u64, report: Option<ErrorReport>) {
    let (source, chain) = report
        .map(|report| (report.source, report.messages))
        .unwrap_or(("unknown", Vec::new()));
    let detail = chain.first().map(String::as_str).unwrap_or("no diagnostic available");

    if status.is_server_error() {
        error!(
            target = "rendercache::http::response",
            status = status.as_u16(),
            method = %line.method,
            path = %line.path,
            route = %line.route,
            elapsed_ms,
            source,
            detail,
            chain = ?chain,
            request_id = %line.request_id,
            "page request failed",
        );
    } else {
        warn!(
            target = "rendercache::http::response",
            status = status.as_u16(),
            method = %line.method,
            path = %line.path,
            elapsed_ms,
            source,
            detail,
            request_id = %line.request_id,
            "page request rejected",
        );
    }
}
