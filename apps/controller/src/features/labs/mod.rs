pub mod repo;
pub mod routes;

use axum::routing::{get, post};
use axum::Router;

pub fn router() -> Router {
    Router::new()
        .route("/labs", get(routes::list))
        .route("/labs/:id", get(routes::get))
        .route("/labs/:id/up", post(routes::up))
        .route("/labs/:id/down", post(routes::down))
        .route("/labs/:id/status", get(routes::status))
        .route("/labs/:id/nodes/:node_name/:action", post(routes::node_action))
        .route("/labs/:id/locks/release", post(routes::release_lock))
}
