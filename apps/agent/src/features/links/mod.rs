//! Hot-connect link management.
//!
//! Links are broadcast-domain memberships, not cables: connect sets the
//! target port onto the source port's VLAN, disconnect re-isolates the
//! target on a fresh tag. Nodes may be referred to by topology node name
//! (resolved through container labels) or full container name.

use std::collections::HashMap;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use bollard::container::ListContainersOptions;
use tracing::info;
use trellis_types::{
    LinkCreate, LinkCreateResponse, LinkDeleteResponse, LinkInfo, LinkListResponse, LinkState,
};

use crate::network::plugin::LABEL_LAB_ID;
use crate::provider::docker::LABEL_NODE_NAME;
use crate::provider::topology::link_id;
use crate::AppState;

pub fn router() -> Router {
    Router::new()
        .route("/links", get(list_links).post(create_link))
        .route("/links/:link_id", axum::routing::delete(delete_link))
}

/// Resolve a node reference to `(container_name, lab_id)`.
async fn resolve_node(st: &AppState, node: &str) -> Result<(String, String), String> {
    // Full container names resolve directly.
    if let Ok(inspect) = st.docker.inspect_container(node, None).await {
        let lab_id = inspect
            .config
            .as_ref()
            .and_then(|config| config.labels.as_ref())
            .and_then(|labels| labels.get(LABEL_LAB_ID))
            .cloned()
            .ok_or_else(|| format!("container {node} carries no lab label"))?;
        return Ok((node.to_string(), lab_id));
    }

    // Topology node names resolve through labels; ambiguity across labs is
    // an error the caller resolves by passing the container name.
    let options = ListContainersOptions::<String> {
        all: true,
        filters: HashMap::from([(
            "label".to_string(),
            vec![format!("{LABEL_NODE_NAME}={node}")],
        )]),
        ..Default::default()
    };
    let matches = st
        .docker
        .list_containers(Some(options))
        .await
        .map_err(|err| err.to_string())?;

    match matches.len() {
        0 => Err(format!("no container found for node {node}")),
        1 => {
            let container = &matches[0];
            let name = container
                .names
                .as_ref()
                .and_then(|names| names.first())
                .map(|name| name.trim_start_matches('/').to_string())
                .ok_or_else(|| format!("container for node {node} has no name"))?;
            let lab_id = container
                .labels
                .as_ref()
                .and_then(|labels| labels.get(LABEL_LAB_ID))
                .cloned()
                .ok_or_else(|| format!("container {name} carries no lab label"))?;
            Ok((name, lab_id))
        }
        n => Err(format!(
            "node name {node} is ambiguous across {n} labs, use the container name"
        )),
    }
}

async fn create_link(
    Extension(st): Extension<AppState>,
    Json(req): Json<LinkCreate>,
) -> Result<Json<LinkCreateResponse>, (StatusCode, String)> {
    let (container_a, lab_a) = match resolve_node(&st, &req.source_node).await {
        Ok(resolved) => resolved,
        Err(err) => return Err((StatusCode::NOT_FOUND, err)),
    };
    let (container_b, lab_b) = match resolve_node(&st, &req.target_node).await {
        Ok(resolved) => resolved,
        Err(err) => return Err((StatusCode::NOT_FOUND, err)),
    };
    if lab_a != lab_b {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("endpoints belong to different labs ({lab_a} vs {lab_b})"),
        ));
    }

    let id = link_id(
        &req.source_node,
        &req.source_interface,
        &req.target_node,
        &req.target_interface,
    );

    match st
        .plugin
        .hot_connect(
            &lab_a,
            &container_a,
            &req.source_interface,
            &container_b,
            &req.target_interface,
        )
        .await
    {
        Ok(vlan_tag) => {
            let link = LinkInfo {
                link_id: id.clone(),
                lab_id: lab_a,
                source_node: req.source_node,
                source_interface: req.source_interface,
                target_node: req.target_node,
                target_interface: req.target_interface,
                state: LinkState::Connected,
                vlan_tag: Some(vlan_tag),
            };
            st.links.lock().await.insert(id, link.clone());
            info!(link_id = %link.link_id, vlan = vlan_tag, "link connected");
            Ok(Json(LinkCreateResponse {
                success: true,
                link: Some(link),
                error: None,
            }))
        }
        Err(err) => Ok(Json(LinkCreateResponse {
            success: false,
            link: None,
            error: Some(format!("{err:#}")),
        })),
    }
}

async fn delete_link(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<LinkDeleteResponse>, (StatusCode, String)> {
    let stored = st.links.lock().await.get(&id).cloned();

    let (target_node, target_interface) = match &stored {
        Some(link) => (link.target_node.clone(), link.target_interface.clone()),
        None => parse_link_target(&id)
            .ok_or_else(|| (StatusCode::BAD_REQUEST, format!("unparseable link id {id}")))?,
    };

    let (container, lab_id) = match resolve_node(&st, &target_node).await {
        Ok(resolved) => resolved,
        Err(err) => return Err((StatusCode::NOT_FOUND, err)),
    };

    match st
        .plugin
        .hot_disconnect(&lab_id, &container, &target_interface)
        .await
    {
        Ok(new_tag) => {
            let mut links = st.links.lock().await;
            if let Some(link) = links.get_mut(&id) {
                link.state = LinkState::Disconnected;
                link.vlan_tag = Some(new_tag);
            }
            info!(link_id = %id, vlan = new_tag, "link disconnected");
            Ok(Json(LinkDeleteResponse {
                success: true,
                error: None,
            }))
        }
        Err(err) => Ok(Json(LinkDeleteResponse {
            success: false,
            error: Some(format!("{err:#}")),
        })),
    }
}

async fn list_links(Extension(st): Extension<AppState>) -> Json<LinkListResponse> {
    let links = st.links.lock().await.values().cloned().collect();
    Json(LinkListResponse { links })
}

/// Second endpoint of a canonical `a:ifa-b:ifb` link id.
fn parse_link_target(id: &str) -> Option<(String, String)> {
    let (_, second) = id.split_once('-')?;
    let (node, interface) = second.split_once(':')?;
    Some((node.to_string(), interface.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_canonical_link_id_target() {
        assert_eq!(
            parse_link_target("r1:eth1-r2:eth1"),
            Some(("r2".to_string(), "eth1".to_string()))
        );
        assert_eq!(parse_link_target("garbage"), None);
    }
}
