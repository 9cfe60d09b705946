use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde_json::json;
use tracing::{error, info};
use trellis_types::{JobResult, JobStatus, LabStatusResponse, NodeAction, NodeActionRequest};
use uuid::Uuid;

use crate::core::orchestrator::{self, OrchestratorError};
use crate::features::hosts::repo::HostRow;
use crate::features::topology::repo::LabRow;
use crate::AppState;

fn db_error(err: sqlx::Error) -> StatusCode {
    match err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        other => {
            error!(error = ?other, "database error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub async fn list(Extension(st): Extension<AppState>) -> Result<Json<Vec<LabRow>>, StatusCode> {
    st.labs.list().await.map(Json).map_err(db_error)
}

pub async fn get(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LabRow>, StatusCode> {
    st.labs.get(&id).await.map(Json).map_err(db_error)
}

fn orchestrator_error(err: OrchestratorError) -> (StatusCode, String) {
    let status = match &err {
        OrchestratorError::NoAgentAvailable { .. }
        | OrchestratorError::MissingHosts { .. }
        | OrchestratorError::AgentUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        OrchestratorError::InvalidTopology(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::Database(_) | OrchestratorError::Internal(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
        OrchestratorError::JobFailed { .. } => StatusCode::BAD_GATEWAY,
    };
    (status, err.to_string())
}

pub async fn up(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let job_id = orchestrator::lab_up(&st, &id)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!({ "lab_id": id, "job_id": job_id })))
}

pub async fn down(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let job_id = orchestrator::lab_down(&st, &id)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!({ "lab_id": id, "job_id": job_id })))
}

/// The agent actually holding a lab's pieces: the node's placement record
/// when one exists, else the lab's last-known agent. Not the selector;
/// status and node actions must land where the containers are, not where a
/// fresh job would schedule.
async fn resolve_lab_agent(
    st: &AppState,
    lab_id: &str,
    node_name: Option<&str>,
) -> Result<HostRow, (StatusCode, String)> {
    let placements = st
        .topology
        .placements(lab_id)
        .await
        .map_err(|err| (db_error(err), "could not load placements".to_string()))?;

    let placed = node_name
        .and_then(|node| placements.iter().find(|p| p.node_name == node))
        .map(|p| p.host_id.clone());

    let agent_id = match placed {
        Some(host_id) => Some(host_id),
        None => {
            let lab = st
                .labs
                .get(lab_id)
                .await
                .map_err(|err| (db_error(err), "lab not found".to_string()))?;
            lab.agent_id
                .or_else(|| placements.first().map(|p| p.host_id.clone()))
        }
    };

    let Some(agent_id) = agent_id else {
        return Err((
            StatusCode::CONFLICT,
            "lab has no associated agent".to_string(),
        ));
    };
    st.hosts
        .get(&agent_id)
        .await
        .map_err(|err| (db_error(err), "agent not found".to_string()))
}

/// Live node list straight from the lab's agent; not lock-protected, so it
/// may race with an in-flight deploy.
pub async fn status(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LabStatusResponse>, (StatusCode, String)> {
    let agent = resolve_lab_agent(&st, &id, None).await?;
    let response = st
        .agent_client
        .lab_status(&agent.address, &id)
        .await
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;
    Ok(Json(response))
}

/// Start or stop a single node on the agent hosting it.
pub async fn node_action(
    Extension(st): Extension<AppState>,
    Path((id, node_name, action)): Path<(String, String, String)>,
) -> Result<Json<JobResult>, (StatusCode, String)> {
    let action = match action.as_str() {
        "start" => NodeAction::Start,
        "stop" => NodeAction::Stop,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown node action: {other}"),
            ))
        }
    };

    let agent = resolve_lab_agent(&st, &id, Some(&node_name)).await?;

    let display_name = st
        .topology
        .nodes(&id)
        .await
        .map_err(|err| (db_error(err), "could not load nodes".to_string()))?
        .into_iter()
        .find(|node| node.container_name == node_name)
        .and_then(|node| node.display_name);

    let job_id = Uuid::new_v4().to_string();
    st.jobs
        .create(&job_id, &id, Some(&agent.id), "node-action")
        .await
        .map_err(|err| (db_error(err), "could not create job".to_string()))?;
    st.jobs
        .mark_running(&job_id)
        .await
        .map_err(|err| (db_error(err), "could not start job".to_string()))?;

    let request = NodeActionRequest {
        job_id: job_id.clone(),
        lab_id: id.clone(),
        node_name,
        display_name,
        action,
    };
    info!(lab_id = %id, node = %request.log_name(), action = ?action, agent_id = %agent.id, "dispatching node action");

    match st.agent_client.node_action(&agent.address, &request).await {
        Ok(result) => {
            let status = if result.status == JobStatus::Completed {
                "completed"
            } else {
                "failed"
            };
            let mut log = result.stdout.clone();
            if let Some(message) = &result.error_message {
                log.push('\n');
                log.push_str(message);
            }
            let _ = st.jobs.finish(&job_id, status, &log).await;
            Ok(Json(result))
        }
        Err(err) => {
            let _ = st.jobs.finish(&job_id, "failed", &err.to_string()).await;
            Err((StatusCode::BAD_GATEWAY, err.to_string()))
        }
    }
}

/// Admin escape hatch: clear a stuck deploy lock on the lab's agent.
pub async fn release_lock(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let agent = resolve_lab_agent(&st, &id, None).await?;
    let result = st
        .agent_client
        .release_lock(&agent.address, &id)
        .await
        .map_err(|err| (StatusCode::BAD_GATEWAY, err.to_string()))?;
    Ok(Json(result))
}
