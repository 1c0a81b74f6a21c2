use axum::{extract::State, response::Json as ResponseJson};
use idempotency::StoreStats;

use crate::{error::ApiError, response::ApiResponse, state::AppState};

pub async fn get_stats(
    State(state): State<AppState>,
) -> Result<ResponseJson<ApiResponse<StoreStats>>, ApiError> {
    let stats = state.idempotency.stats().await?;
    Ok(ResponseJson(ApiResponse::success(stats)))
}
