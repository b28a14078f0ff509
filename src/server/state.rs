//! State inspection endpoint for observability.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::types::RepoId;

use super::AppState;

/// Returns a repository's persisted queue state as JSON.
///
/// 404 when the repository has no tracked state.
pub async fn state_handler(
    State(app_state): State<AppState>,
    Path((owner, repo)): Path<(String, String)>,
) -> Response {
    let repo = RepoId::new(owner, repo);

    if !app_state.store().contains(&repo).await {
        return (StatusCode::NOT_FOUND, "no state for this repository").into_response();
    }

    let state = app_state.store().read(&repo, |state| state.clone()).await;
    Json(state).into_response()
}
