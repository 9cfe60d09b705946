//! Lab status, discovery and orphan cleanup.
//!
//! Reads are not lock-protected and may race with a concurrent deploy; the
//! controller reconciler expects point-in-time answers, not transactions.

use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use trellis_types::{
    CleanupOrphansRequest, CleanupOrphansResponse, DiscoverLabsResponse, DiscoveredLab,
    LabStatusRequest, LabStatusResponse,
};

use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/labs/status", post(lab_status))
        .route("/discover-labs", get(discover_labs))
        .route("/cleanup-orphans", post(cleanup_orphans))
}

async fn lab_status(
    Extension(st): Extension<AppState>,
    Json(req): Json<LabStatusRequest>,
) -> Json<LabStatusResponse> {
    let status = st.provider.status(&req.lab_id).await;
    Json(LabStatusResponse {
        lab_id: req.lab_id,
        nodes: status.nodes,
        error: status.error,
    })
}

async fn discover_labs(Extension(st): Extension<AppState>) -> Json<DiscoverLabsResponse> {
    let discovered = st.provider.discover_labs().await;
    let labs = discovered
        .into_iter()
        .map(|(lab_id, nodes)| DiscoveredLab { lab_id, nodes })
        .collect();
    Json(DiscoverLabsResponse { labs })
}

async fn cleanup_orphans(
    Extension(st): Extension<AppState>,
    Json(req): Json<CleanupOrphansRequest>,
) -> Json<CleanupOrphansResponse> {
    let (removed_containers, errors) = st.provider.cleanup_orphans(&req.valid_lab_ids).await;
    Json(CleanupOrphansResponse {
        removed_containers,
        errors,
    })
}
