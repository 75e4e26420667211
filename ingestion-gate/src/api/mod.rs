use std::{convert::Infallible, sync::Arc};

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower::limit::ConcurrencyLimitLayer;

use crate::context::AppContext;

pub mod errors;
pub mod ingest;
pub mod status;

pub use errors::ApiError;

pub fn router(context: Arc<AppContext>, max_body_size: usize, upload_concurrency: usize) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(index))
        .route("/api/v1/ingest/stats", get(status::get_stats))
        .route("/api/v1/ingest/status/:batch_id", get(status::get_status))
        .route(
            "/api/v1/ingest/status/:batch_id/abort",
            post(status::post_abort),
        )
        .route(
            "/api/v1/ingest/:source_kind",
            post(ingest::post_ingest)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(upload_concurrency.max(1)))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .with_state(context)
}

pub async fn index() -> &'static str {
    "ingestion gate"
}
