//! Sample guarded mutation for the reference host. Every fresh execution
//! mints a new resource id, which makes replays observable: a replayed
//! response carries the id of the first execution.

use axum::{Json, http::StatusCode, response::Json as ResponseJson};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::response::ApiResponse;

#[derive(Debug, Serialize, Deserialize)]
pub struct EchoResource {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

pub async fn create_echo(
    Json(payload): Json<Value>,
) -> (StatusCode, ResponseJson<ApiResponse<EchoResource>>) {
    let resource = EchoResource {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        payload,
    };
    (
        StatusCode::CREATED,
        ResponseJson(ApiResponse::success(resource)),
    )
}
