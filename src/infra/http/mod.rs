//! HTTP adapter: one GET route per registered page pattern.

mod middleware;

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Router,
    extract::{MatchedPath, Query, RawPathParams, State},
    http::{StatusCode, Uri},
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    application::error::AppError,
    cache::{EngineError, PageResponse, RenderEngine, RenderProps},
};

pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use middleware::{log_responses, set_request_context};

#[derive(Clone)]
pub struct HttpState {
    pub engine: Arc<RenderEngine>,
}

/// Build a router exposing every route registered on `engine`.
///
/// Patterns use axum's `{param}` syntax; captured parameters and the query
/// string are handed to renderers through [`RenderProps`].
pub fn build_router(engine: Arc<RenderEngine>) -> Router {
    let mut pages = Router::new();
    for (pattern, _strategy) in engine.routes() {
        pages = pages.route(&pattern, get(render_page));
    }

    pages
        .route("/_health", get(health))
        .fallback(not_found)
        .with_state(HttpState { engine })
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn render_page(
    State(state): State<HttpState>,
    matched: MatchedPath,
    params: RawPathParams,
    Query(query): Query<BTreeMap<String, String>>,
    uri: Uri,
) -> Result<PageResponse, AppError> {
    let mut props = RenderProps::new(uri.path());
    props.params = params
        .iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();
    props.query = query;

    let page = state.engine.render(matched.as_str(), props).await?;
    Ok(page)
}

async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn not_found(uri: Uri) -> Response {
    EngineError::UnknownRoute {
        route: uri.path().to_string(),
    }
    .into_response()
}
