use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    context::AppContext,
    source::SourceFormat,
    types::{BatchStatus, SourceKind},
};

use super::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    pub format: Option<String>,
    pub label: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct IngestResponse {
    pub batch_id: Uuid,
    pub source_kind: SourceKind,
    pub source_label: String,
    pub status: BatchStatus,
}

/// Starts a batch over the uploaded body and answers before it is processed.
pub async fn post_ingest(
    State(context): State<Arc<AppContext>>,
    Path(source_kind): Path<String>,
    Query(params): Query<IngestParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let source_kind: SourceKind = source_kind.parse()?;
    let format: SourceFormat = match params.format.as_deref() {
        Some(format) => format.parse()?,
        None => SourceFormat::Csv,
    };
    let label = params
        .label
        .filter(|label| !label.trim().is_empty())
        .unwrap_or_else(|| format!("upload.{format}"));

    debug!(%source_kind, %format, label = %label, bytes = body.len(), "received upload");
    let source = format.open(body)?;
    let batch = context.start_batch(source_kind, &label, source).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            batch_id: batch.batch_id,
            source_kind: batch.source_kind,
            source_label: batch.source_label,
            status: batch.status,
        }),
    ))
}
