use axum::routing::get;
use axum::{Extension, Json, Router};
use serde_json::json;

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .route("/dead-letters", get(dead_letters))
}

async fn health(Extension(st): Extension<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "agent_id": st.cfg.agent_id,
        "registered": st.registration.is_registered(),
        "active_jobs": st.registration.active_jobs(),
        "timestamp": chrono::Utc::now(),
    }))
}

async fn info(Extension(st): Extension<AppState>) -> Json<trellis_types::AgentInfo> {
    Json(st.registration.agent_info())
}

/// Callbacks that exhausted every delivery attempt, for operators chasing
/// missing job results.
async fn dead_letters(Extension(st): Extension<AppState>) -> Json<serde_json::Value> {
    let letters: Vec<serde_json::Value> = st
        .callbacks
        .dead_letters()
        .await
        .into_iter()
        .map(|letter| {
            json!({
                "job_id": letter.job_id,
                "callback_url": letter.callback_url,
                "status": letter.status,
                "attempts": letter.attempts,
                "created_at": letter.created_at,
            })
        })
        .collect();
    Json(json!({ "dead_letters": letters }))
}
