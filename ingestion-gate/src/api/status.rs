use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    context::{AbortResult, AppContext},
    types::{BatchStatistics, ImportBatch},
};

use super::ApiError;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct AbortResponse {
    pub batch_id: Uuid,
    pub aborting: bool,
}

pub async fn get_status(
    State(context): State<Arc<AppContext>>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<ImportBatch>, ApiError> {
    Ok(Json(context.tracker.get_status(batch_id).await?))
}

pub async fn post_abort(
    State(context): State<Arc<AppContext>>,
    Path(batch_id): Path<Uuid>,
) -> Result<(StatusCode, Json<AbortResponse>), ApiError> {
    match context.abort(batch_id).await? {
        AbortResult::Signalled => Ok((
            StatusCode::ACCEPTED,
            Json(AbortResponse {
                batch_id,
                aborting: true,
            }),
        )),
        AbortResult::NotRunning => Err(ApiError::Conflict(format!(
            "batch {batch_id} is not running in this process"
        ))),
    }
}

pub async fn get_stats(
    State(context): State<Arc<AppContext>>,
) -> Result<Json<BatchStatistics>, ApiError> {
    Ok(Json(context.tracker.statistics().await?))
}
