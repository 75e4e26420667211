use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt; // for `collect`
use ingestion_gate::{
    api::router, context::AppContext, metrics::setup_metrics_routes, store::MemoryStore,
};
use tower::ServiceExt; // for `oneshot`

mod common;

// Installs the global recorder, so this binary holds a single test.
#[tokio::test]
async fn test_requests_are_counted_by_route_template() {
    let store = Arc::new(MemoryStore::new());
    let context = Arc::new(AppContext::new(
        store.clone(),
        store,
        None,
        common::driver_policy(),
    ));
    let app = setup_metrics_routes(router(context, 1_000_000, 4)).unwrap();

    let missing = uuid::Uuid::now_v7();
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/ingest/status/{missing}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let rendered = String::from_utf8(body.to_vec()).unwrap();

    let counted = rendered
        .lines()
        .find(|line| {
            line.starts_with("http_requests_total{")
                && line.contains(r#"path="/api/v1/ingest/status/:batch_id""#)
                && line.contains(r#"status="404""#)
        })
        .unwrap_or_else(|| panic!("no per-route counter in:\n{rendered}"));
    assert!(counted.ends_with(" 1"));
    assert!(!rendered.contains(&missing.to_string()));
}
