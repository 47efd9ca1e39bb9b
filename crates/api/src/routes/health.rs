//! Health check endpoint

use axum::{extract::State, Json};
use serde_json::json;

use crate::error::ApiResult;
use crate::state::AppState;

/// Liveness check with a database ping
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(&state.pool)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}
