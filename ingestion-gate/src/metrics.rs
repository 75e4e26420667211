//! Prometheus exposition plus per-route HTTP metrics for the API router.
use std::{future::ready, time::Instant};

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware::{from_fn, Next},
    response::Response,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;

use crate::metrics_const::{HTTP_REQUESTS_COUNTER, HTTP_REQUEST_DURATION_HISTOGRAM};

pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(bind).await?;
    axum::serve(listener, router).await
}

/// Mounts `/metrics` and wraps every route in [`track_metrics`]. Installs the
/// global recorder, so it can only succeed once per process.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let handle = setup_metrics_recorder()?;

    Ok(router
        .route("/metrics", get(move || ready(handle.render())))
        .layer(from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    // Seconds, from a single admission up to a multi-hour batch
    const BUCKETS: &[f64] = &[
        0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0, 600.0, 3600.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// Counts requests and their latency. The path label is the route template
/// whenever one matched.
pub async fn track_metrics(req: Request<Body>, next: Next) -> Response {
    let route = match req.extensions().get::<MatchedPath>() {
        Some(matched) => matched.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().as_str().to_owned();
    let start = Instant::now();

    let response = next.run(req).await;

    let labels = [
        ("method", method),
        ("path", route),
        ("status", response.status().as_u16().to_string()),
    ];
    metrics::counter!(HTTP_REQUESTS_COUNTER, &labels).increment(1);
    metrics::histogram!(HTTP_REQUEST_DURATION_HISTOGRAM, &labels)
        .record(start.elapsed().as_secs_f64());

    response
}
