//! Direct plugin-fabric operations: lab-bridge VXLAN tunnels, external
//! interface attachment, and plugin state introspection.
//!
//! The lab-bridge VXLAN port is the alternative cross-host strategy to the
//! overlay manager's helper bridge; the controller picks per link. External
//! attachment pulls physical host NICs into a lab's broadcast domains.

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use tracing::info;
use trellis_types::{
    ExternalAttachRequest, ExternalAttachResponse, ExternalConnectRequest,
    ExternalConnectResponse, ExternalInterfaceInfo, ExternalListResponse, PluginVxlanRequest,
    PluginVxlanResponse,
};

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/plugin/status", get(plugin_status))
        .route("/plugin/labs/:lab_id", get(plugin_lab_status))
        .route("/plugin/vxlan", post(create_vxlan))
        .route("/plugin/vxlan/:lab_id/:vni", delete(delete_vxlan))
        .route("/external/attach", post(attach_external))
        .route("/external/connect", post(connect_external))
        .route("/external/:lab_id", get(list_external))
        .route("/external/:lab_id/:iface", delete(detach_external))
}

async fn plugin_status(Extension(st): Extension<AppState>) -> Json<serde_json::Value> {
    Json(st.plugin.status().await)
}

async fn plugin_lab_status(
    Extension(st): Extension<AppState>,
    Path(lab_id): Path<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    st.plugin
        .lab_status(&lab_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn create_vxlan(
    Extension(st): Extension<AppState>,
    Json(req): Json<PluginVxlanRequest>,
) -> Json<PluginVxlanResponse> {
    info!(lab_id = %req.lab_id, link_id = %req.link_id, vni = req.vni, "plugin VXLAN tunnel request");
    match st
        .plugin
        .create_vxlan_tunnel(
            &req.lab_id,
            &req.link_id,
            &req.local_ip,
            &req.remote_ip,
            req.vni,
            req.vlan_tag,
        )
        .await
    {
        Ok(port_name) => Json(PluginVxlanResponse {
            success: true,
            port_name: Some(port_name),
            error: None,
        }),
        Err(err) => Json(PluginVxlanResponse {
            success: false,
            port_name: None,
            error: Some(format!("{err:#}")),
        }),
    }
}

async fn delete_vxlan(
    Extension(st): Extension<AppState>,
    Path((lab_id, vni)): Path<(String, u32)>,
) -> Result<Json<PluginVxlanResponse>, (StatusCode, String)> {
    match st.plugin.delete_vxlan_tunnel(&lab_id, vni).await {
        Ok(true) => Ok(Json(PluginVxlanResponse {
            success: true,
            port_name: None,
            error: None,
        })),
        Ok(false) => Err((StatusCode::NOT_FOUND, format!("no tunnel with VNI {vni}"))),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))),
    }
}

async fn attach_external(
    Extension(st): Extension<AppState>,
    Json(req): Json<ExternalAttachRequest>,
) -> Json<ExternalAttachResponse> {
    match st
        .plugin
        .attach_external(&req.lab_id, &req.external_interface, req.vlan_tag)
        .await
    {
        Ok(vlan_tag) => Json(ExternalAttachResponse {
            success: true,
            vlan_tag,
            error: None,
        }),
        Err(err) => Json(ExternalAttachResponse {
            success: false,
            vlan_tag: 0,
            error: Some(format!("{err:#}")),
        }),
    }
}

async fn connect_external(
    Extension(st): Extension<AppState>,
    Json(req): Json<ExternalConnectRequest>,
) -> Json<ExternalConnectResponse> {
    match st
        .plugin
        .connect_to_external(
            &req.lab_id,
            &req.container_name,
            &req.interface_name,
            &req.external_interface,
        )
        .await
    {
        Ok(vlan_tag) => Json(ExternalConnectResponse {
            success: true,
            vlan_tag: Some(vlan_tag),
            error: None,
        }),
        Err(err) => Json(ExternalConnectResponse {
            success: false,
            vlan_tag: None,
            error: Some(format!("{err:#}")),
        }),
    }
}

async fn list_external(
    Extension(st): Extension<AppState>,
    Path(lab_id): Path<String>,
) -> Json<ExternalListResponse> {
    let interfaces = st
        .plugin
        .list_external(&lab_id)
        .await
        .into_iter()
        .map(|(interface, vlan_tag)| ExternalInterfaceInfo { interface, vlan_tag })
        .collect();
    Json(ExternalListResponse { lab_id, interfaces })
}

async fn detach_external(
    Extension(st): Extension<AppState>,
    Path((lab_id, iface)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    match st.plugin.detach_external(&lab_id, &iface).await {
        Ok(true) => Ok(Json(serde_json::json!({ "success": true }))),
        Ok(false) => Err((
            StatusCode::NOT_FOUND,
            format!("{iface} is not attached to lab {lab_id}"),
        )),
        Err(err) => Err((StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}"))),
    }
}
