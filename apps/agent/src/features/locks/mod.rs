//! Deploy-lock introspection and stuck-lock recovery.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use tracing::warn;
use trellis_types::LockListResponse;

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/locks/status", get(status))
        .route("/locks/:lab_id/release", post(release))
}

async fn status(
    Extension(st): Extension<AppState>,
) -> Result<Json<LockListResponse>, (StatusCode, String)> {
    let locks = st
        .locks
        .all_locks()
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(LockListResponse { locks }))
}

async fn release(
    Extension(st): Extension<AppState>,
    Path(lab_id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    warn!(lab_id = %lab_id, "operator-requested lock release");
    let deleted = st
        .locks
        .force_release(&lab_id)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    Ok(Json(json!({
        "status": if deleted { "cleared" } else { "not_held" },
        "lab_id": lab_id,
    })))
}
