//! Receivers for agent job callbacks.
//!
//! Async jobs answer `accepted` at dispatch; the real outcome lands here. A
//! completion finishes the job and moves the lab; heartbeats refresh job
//! liveness; dead letters mark the job failed with the delivery history.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Extension, Json, Router};
use tracing::{error, info, warn};
use trellis_types::{CallbackPayload, JobStatus};

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/callbacks/job/:job_id", post(job_completed))
        .route("/callbacks/job/:job_id/heartbeat", post(job_heartbeat))
        .route("/callbacks/dead-letter/:job_id", post(job_dead_letter))
}

async fn job_completed(
    Extension(st): Extension<AppState>,
    Path(job_id): Path<String>,
    Json(payload): Json<CallbackPayload>,
) -> Result<StatusCode, StatusCode> {
    info!(job_id = %job_id, status = ?payload.status, agent_id = %payload.agent_id, "job callback");

    let job = st.jobs.get(&job_id).await.map_err(|err| match err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        other => {
            error!(error = ?other, "failed to load job for callback");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    let (status, lab_state) = match payload.status {
        JobStatus::Completed => ("completed", "running"),
        _ => ("failed", "error"),
    };

    let mut log = payload.stdout.clone();
    if !payload.stderr.is_empty() {
        log.push('\n');
        log.push_str(&payload.stderr);
    }
    if let Some(message) = &payload.error_message {
        log.push('\n');
        log.push_str(message);
    }

    let transitioned = st.jobs.finish(&job_id, status, &log).await.map_err(|err| {
        error!(error = ?err, "failed to finish job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if !transitioned {
        // Duplicate or late callback; terminal jobs stay terminal.
        warn!(job_id = %job_id, "callback for already-terminal job ignored");
        return Ok(StatusCode::OK);
    }

    if job.action == "deploy" {
        let error_message = payload.error_message.as_deref();
        let state_error = if status == "failed" { error_message } else { None };
        if let Err(err) = st.labs.set_state(&job.lab_id, lab_state, state_error).await {
            error!(error = ?err, lab_id = %job.lab_id, "failed to update lab state");
        }
        if status == "completed" {
            let _ = st.labs.set_agent(&job.lab_id, Some(&payload.agent_id)).await;
            if let Some(node_states) = &payload.node_states {
                for node_name in node_states.keys() {
                    let _ = st
                        .topology
                        .record_placement(&job.lab_id, node_name, &payload.agent_id)
                        .await;
                }
            }
        }
    } else if job.action == "destroy" {
        let next = if status == "completed" { "stopped" } else { "error" };
        let _ = st
            .labs
            .set_state(&job.lab_id, next, payload.error_message.as_deref())
            .await;
    }

    Ok(StatusCode::OK)
}

async fn job_heartbeat(
    Extension(st): Extension<AppState>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let alive = st.jobs.touch_heartbeat(&job_id).await.map_err(|err| {
        error!(error = ?err, "failed to record job heartbeat");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    if alive {
        Ok(StatusCode::OK)
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

/// The agent exhausted its callback retries. Whatever the payload says, the
/// job can no longer be trusted to report again, so a non-terminal job is
/// failed with the delivery history.
async fn job_dead_letter(
    Extension(st): Extension<AppState>,
    Path(job_id): Path<String>,
    Json(payload): Json<CallbackPayload>,
) -> Result<StatusCode, StatusCode> {
    warn!(job_id = %job_id, status = ?payload.status, "dead-letter callback received");

    let log = format!(
        "callback delivery exhausted retries; final status {:?}: {}",
        payload.status,
        payload.error_message.as_deref().unwrap_or("")
    );
    let transitioned = st.jobs.finish(&job_id, "failed", &log).await.map_err(|err| {
        error!(error = ?err, "failed to fail dead-lettered job");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    if transitioned {
        if let Ok(job) = st.jobs.get(&job_id).await {
            let _ = st
                .labs
                .set_state(&job.lab_id, "error", Some("job callback was dead-lettered"))
                .await;
        }
    }
    Ok(StatusCode::OK)
}
