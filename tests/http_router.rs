use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{
        Method, Request, StatusCode,
        header::{CACHE_CONTROL, CONTENT_TYPE},
    },
    response::Response,
};
use http_body_util::BodyExt;
use rendercache::{
    application::site,
    cache::{EngineConfig, RENDER_CACHE_HEADER, RenderEngine},
    infra::http::{REQUEST_ID_HEADER, build_router},
};
use tower::ServiceExt;

fn demo_router(config: EngineConfig) -> Router {
    let engine = Arc::new(RenderEngine::new(config));
    site::register(&engine).expect("demo routes register");
    build_router(engine)
}

async fn send(app: &Router, uri: &str) -> Response {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .expect("request should build");
    app.clone()
        .oneshot(request)
        .await
        .expect("router should respond")
}

fn header<'a>(response: &'a Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

async fn body_text(response: Response) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body should collect")
        .to_bytes();
    String::from_utf8(bytes.to_vec()).expect("utf-8 body")
}

#[tokio::test]
async fn fresh_route_is_never_stored() {
    let app = demo_router(EngineConfig::default());

    for _ in 0..2 {
        let response = send(&app, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(header(&response, CACHE_CONTROL.as_str()), "no-store");
        assert_eq!(header(&response, RENDER_CACHE_HEADER), "bypass");
        assert_eq!(
            header(&response, CONTENT_TYPE.as_str()),
            "text/html; charset=utf-8"
        );
    }
}

#[tokio::test]
async fn cache_once_route_advertises_immutable_caching() {
    let app = demo_router(EngineConfig::default());

    let first = send(&app, "/about").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(
        header(&first, CACHE_CONTROL.as_str()),
        "public, max-age=31536000, immutable"
    );
    assert_eq!(header(&first, RENDER_CACHE_HEADER), "miss");
    let first_body = body_text(first).await;

    let second = send(&app, "/about").await;
    assert_eq!(header(&second, RENDER_CACHE_HEADER), "hit");
    assert_eq!(body_text(second).await, first_body);
}

#[tokio::test]
async fn revalidated_route_advertises_its_window() {
    let app = demo_router(EngineConfig::default());

    let response = send(&app, "/posts/hello-world").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        header(&response, CACHE_CONTROL.as_str()),
        "public, s-maxage=30, stale-while-revalidate=30"
    );
    assert!(body_text(response).await.contains("Hello, world"));
}

#[tokio::test]
async fn static_shell_streams_personalised_slots() {
    let app = demo_router(EngineConfig::default());

    let first = send(&app, "/dashboard?name=ada").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(header(&first, CACHE_CONTROL.as_str()), "no-store");
    assert_eq!(header(&first, RENDER_CACHE_HEADER), "shell-miss");
    assert!(body_text(first).await.contains("Hello, ada!"));

    let second = send(&app, "/dashboard?name=grace").await;
    assert_eq!(header(&second, RENDER_CACHE_HEADER), "shell-hit");
    let html = body_text(second).await;
    assert!(html.contains("Hello, grace!"));
    assert!(!html.contains("ada"));
}

#[tokio::test]
async fn render_failures_are_server_errors() {
    let app = demo_router(EngineConfig::default());

    let response = send(&app, "/posts/does-not-exist").await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(RENDER_CACHE_HEADER).is_none());
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let app = demo_router(EngineConfig::default());

    let response = send(&app, "/nope").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(body_text(response).await, "Page not found");
}

#[tokio::test]
async fn health_endpoint_is_empty() {
    let app = demo_router(EngineConfig::default());

    let response = send(&app, "/_health").await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn every_response_carries_a_request_id() {
    let app = demo_router(EngineConfig::default());

    let first = send(&app, "/about").await;
    let second = send(&app, "/nope").await;
    let first_id = header(&first, REQUEST_ID_HEADER.as_str()).to_string();
    let second_id = header(&second, REQUEST_ID_HEADER.as_str()).to_string();

    assert_eq!(first_id.len(), 36);
    assert_eq!(second_id.len(), 36);
    assert_ne!(first_id, second_id);
}

#[tokio::test]
async fn disabled_caching_bypasses_every_route() {
    let app = demo_router(EngineConfig {
        caching_enabled: false,
        ..EngineConfig::default()
    });

    for uri in ["/about", "/posts/hello-world", "/dashboard"] {
        let response = send(&app, uri).await;
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert_eq!(header(&response, CACHE_CONTROL.as_str()), "no-store");
        assert_eq!(header(&response, RENDER_CACHE_HEADER), "bypass");
    }
}
