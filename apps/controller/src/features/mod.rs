use axum::{Extension, Router};

use crate::AppState;

pub mod callbacks;
pub mod hosts;
pub mod jobs;
pub mod labs;
pub mod reconciler;
pub mod topology;

pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(hosts::router())
        .merge(labs::router())
        .merge(jobs::router())
        .merge(callbacks::router())
        .layer(Extension(state))
}
