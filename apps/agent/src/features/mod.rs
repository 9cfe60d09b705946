use axum::{Extension, Router};

use crate::AppState;

pub mod console;
pub mod fabric;
pub mod health;
pub mod jobs;
pub mod labs;
pub mod links;
pub mod locks;
pub mod overlay;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(jobs::router())
        .merge(labs::router())
        .merge(links::router())
        .merge(locks::router())
        .merge(overlay::router())
        .merge(fabric::router())
        .merge(console::router())
        .layer(Extension(state))
}
