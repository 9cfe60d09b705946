use axum::routing::{get, post};
use axum::Router;

pub mod repo;
pub mod routes;

pub fn router() -> Router {
    Router::new()
        .route("/agents", get(routes::list))
        .route("/agents/register", post(routes::register))
        .route("/agents/:id/heartbeat", post(routes::heartbeat))
}
