//! Response assembly: body, `Cache-Control` and cache outcome headers.

use std::convert::Infallible;
use std::fmt;

use axum::{
    body::Body,
    http::{
        HeaderValue,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use futures::stream::BoxStream;

use super::strategy::{RouteStrategy, StrategyKind};

/// Header reporting how the engine produced a response.
pub const RENDER_CACHE_HEADER: &str = "x-render-cache";

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";
const CACHE_ONCE_MAX_AGE: &str = "public, max-age=31536000, immutable";
const NO_STORE: &str = "no-store";

/// How the engine satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Rendered without consulting a cache.
    Bypass,
    Hit,
    Miss,
    /// Served stale bytes; a background refresh may be running.
    Stale,
    ShellHit,
    ShellMiss,
}

impl RenderOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RenderOutcome::Bypass => "bypass",
            RenderOutcome::Hit => "hit",
            RenderOutcome::Miss => "miss",
            RenderOutcome::Stale => "stale",
            RenderOutcome::ShellHit => "shell-hit",
            RenderOutcome::ShellMiss => "shell-miss",
        }
    }
}

impl fmt::Display for RenderOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub enum PageBody {
    Full(Bytes),
    /// Shell segments interleaved with per-request slot fragments.
    Stream(BoxStream<'static, Result<Bytes, Infallible>>),
}

impl fmt::Debug for PageBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageBody::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            PageBody::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A rendered page ready to be written to the client.
#[derive(Debug)]
pub struct PageResponse {
    pub body: PageBody,
    pub cache_control: String,
    pub outcome: RenderOutcome,
}

impl PageResponse {
    pub fn full(bytes: Bytes, strategy: &RouteStrategy, outcome: RenderOutcome) -> Self {
        Self {
            body: PageBody::Full(bytes),
            cache_control: cache_control(strategy),
            outcome,
        }
    }

    pub fn streamed(
        stream: BoxStream<'static, Result<Bytes, Infallible>>,
        strategy: &RouteStrategy,
        outcome: RenderOutcome,
    ) -> Self {
        Self {
            body: PageBody::Stream(stream),
            cache_control: cache_control(strategy),
            outcome,
        }
    }

    /// Drain the body into one buffer.
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            PageBody::Full(bytes) => bytes,
            PageBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(Ok(chunk)) = stream.next().await {
                    buffer.extend_from_slice(&chunk);
                }
                buffer.freeze()
            }
        }
    }
}

/// `Cache-Control` value advertised for `strategy`.
pub fn cache_control(strategy: &RouteStrategy) -> String {
    match strategy.kind {
        StrategyKind::Fresh | StrategyKind::StaticShell => NO_STORE.to_string(),
        StrategyKind::CacheOnce => CACHE_ONCE_MAX_AGE.to_string(),
        StrategyKind::CacheWithRevalidation => {
            let secs = strategy.revalidate_after.as_secs();
            format!("public, s-maxage={secs}, stale-while-revalidate={secs}")
        }
    }
}

impl IntoResponse for PageResponse {
    fn into_response(self) -> Response {
        let body = match self.body {
            PageBody::Full(bytes) => Body::from(bytes),
            PageBody::Stream(stream) => Body::from_stream(stream),
        };

        let mut response = Response::new(body);
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE));
        if let Ok(value) = HeaderValue::from_str(&self.cache_control) {
            headers.insert(CACHE_CONTROL, value);
        }
        headers.insert(
            RENDER_CACHE_HEADER,
            HeaderValue::from_static(self.outcome.as_str()),
        );
        response
    }
}
