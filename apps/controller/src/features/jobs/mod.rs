pub mod repo;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Extension, Json, Router};
use tracing::error;

use crate::AppState;

pub fn router() -> Router {
    Router::new().route("/jobs/:id", get(get_job))
}

async fn get_job(
    Extension(st): Extension<AppState>,
    Path(id): Path<String>,
) -> Result<Json<repo::JobRow>, StatusCode> {
    st.jobs
        .get(&id)
        .await
        .map(Json)
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StatusCode::NOT_FOUND,
            other => {
                error!(error = ?other, "failed to load job");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        })
}
