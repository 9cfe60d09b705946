use axum::extract::Path;
use axum::http::StatusCode;
use axum::{Extension, Json};
use serde::Serialize;
use tracing::{error, info};
use trellis_types::{
    HeartbeatRequest, HeartbeatResponse, RegistrationRequest, RegistrationResponse,
};

use crate::AppState;

pub async fn register(
    Extension(st): Extension<AppState>,
    Json(req): Json<RegistrationRequest>,
) -> Result<Json<RegistrationResponse>, StatusCode> {
    if let Some(expected) = &st.cfg.registration_token {
        if req.token.as_deref() != Some(expected.as_str()) {
            info!(agent_id = %req.agent.agent_id, "registration rejected: bad token");
            return Ok(Json(RegistrationResponse {
                success: false,
                message: "invalid registration token".to_string(),
            }));
        }
    }

    let agent = req.agent;
    let capabilities = serde_json::to_value(&agent.capabilities).unwrap_or_default();
    st.hosts
        .register(
            &agent.agent_id,
            &agent.name,
            &agent.address,
            capabilities,
            &agent.version,
            agent.started_at,
            agent.is_local,
        )
        .await
        .map_err(|err| {
            error!(error = ?err, "failed to register agent");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    info!(agent_id = %agent.agent_id, address = %agent.address, "agent registered");
    Ok(Json(RegistrationResponse {
        success: true,
        message: String::new(),
    }))
}

pub async fn heartbeat(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<Json<HeartbeatResponse>, StatusCode> {
    let status = serde_json::to_value(req.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "online".to_string());

    st.hosts.heartbeat(&id, &status).await.map_err(|err| match err {
        sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
        other => {
            error!(error = ?other, "failed to record heartbeat");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    })?;

    Ok(Json(HeartbeatResponse { acknowledged: true }))
}

#[derive(Debug, Serialize)]
pub struct HostListItem {
    pub id: String,
    pub name: String,
    pub address: String,
    pub status: String,
    pub capabilities_json: serde_json::Value,
    pub version: String,
    pub is_local: bool,
    pub last_heartbeat: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize)]
pub struct HostListResponse {
    pub items: Vec<HostListItem>,
}

pub async fn list(
    Extension(st): Extension<AppState>,
) -> Result<Json<HostListResponse>, StatusCode> {
    let hosts = st.hosts.list_all().await.map_err(|err| {
        error!(error = ?err, "failed to list hosts");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let items = hosts
        .into_iter()
        .map(|host| HostListItem {
            status: host.derived_status().to_string(),
            id: host.id,
            name: host.name,
            address: host.address,
            capabilities_json: host.capabilities_json,
            version: host.version,
            is_local: host.is_local,
            last_heartbeat: host.last_heartbeat,
        })
        .collect();
    Ok(Json(HostListResponse { items }))
}
