//! Cross-host overlay endpoints.

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use tracing::info;
use trellis_types::{
    AttachContainerRequest, AttachContainerResponse, CleanupOverlayRequest,
    CleanupOverlayResponse, CreateTunnelRequest, CreateTunnelResponse, OverlayStatusResponse,
    TunnelInfo,
};

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/overlay/tunnel", post(create_tunnel))
        .route("/overlay/attach", post(attach_container))
        .route("/overlay/cleanup", post(cleanup))
        .route("/overlay/status", get(status))
}

fn vxlan_disabled() -> (StatusCode, String) {
    (
        StatusCode::BAD_REQUEST,
        "VXLAN overlay not enabled on this agent".to_string(),
    )
}

async fn create_tunnel(
    Extension(st): Extension<AppState>,
    Json(req): Json<CreateTunnelRequest>,
) -> Result<Json<CreateTunnelResponse>, (StatusCode, String)> {
    if !st.cfg.enable_vxlan {
        return Err(vxlan_disabled());
    }
    info!(lab_id = %req.lab_id, link_id = %req.link_id, remote = %req.remote_ip, "creating overlay tunnel");

    let tunnel = match st
        .overlay
        .create_tunnel(&req.lab_id, &req.link_id, &req.local_ip, &req.remote_ip, req.vni)
        .await
    {
        Ok(tunnel) => tunnel,
        Err(err) => {
            return Ok(Json(CreateTunnelResponse {
                success: false,
                tunnel: None,
                error: Some(format!("{err:#}")),
            }))
        }
    };

    if let Err(err) = st.overlay.create_bridge(&tunnel).await {
        return Ok(Json(CreateTunnelResponse {
            success: false,
            tunnel: None,
            error: Some(format!("{err:#}")),
        }));
    }

    Ok(Json(CreateTunnelResponse {
        success: true,
        tunnel: Some(TunnelInfo {
            vni: tunnel.vni,
            interface_name: tunnel.interface_name,
            local_ip: tunnel.local_ip,
            remote_ip: tunnel.remote_ip,
            lab_id: tunnel.lab_id,
            link_id: tunnel.link_id,
        }),
        error: None,
    }))
}

async fn attach_container(
    Extension(st): Extension<AppState>,
    Json(req): Json<AttachContainerRequest>,
) -> Result<Json<AttachContainerResponse>, (StatusCode, String)> {
    if !st.cfg.enable_vxlan {
        return Err(vxlan_disabled());
    }
    info!(lab_id = %req.lab_id, container = %req.container_name, link_id = %req.link_id, "attaching container to overlay");

    match st
        .overlay
        .attach_container(
            &req.lab_id,
            &req.link_id,
            &req.container_name,
            &req.interface_name,
            req.ip_address.as_deref(),
        )
        .await
    {
        Ok(()) => Ok(Json(AttachContainerResponse {
            success: true,
            error: None,
        })),
        Err(err) => Ok(Json(AttachContainerResponse {
            success: false,
            error: Some(format!("{err:#}")),
        })),
    }
}

async fn cleanup(
    Extension(st): Extension<AppState>,
    Json(req): Json<CleanupOverlayRequest>,
) -> Json<CleanupOverlayResponse> {
    if !st.cfg.enable_vxlan {
        return Json(CleanupOverlayResponse::default());
    }
    let (tunnels_deleted, bridges_deleted, errors) = st.overlay.cleanup_lab(&req.lab_id).await;
    Json(CleanupOverlayResponse {
        tunnels_deleted,
        bridges_deleted,
        errors,
    })
}

async fn status(Extension(st): Extension<AppState>) -> Json<OverlayStatusResponse> {
    if !st.cfg.enable_vxlan {
        return Json(OverlayStatusResponse::default());
    }
    let (tunnels, bridges) = st.overlay.status().await;
    Json(OverlayStatusResponse { tunnels, bridges })
}
