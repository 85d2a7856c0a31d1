//! Release retrieval and artifact download endpoints.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, Request, State},
    http::{header, HeaderValue, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::{info, warn};

use super::error::ApiError;
use crate::extract::ArtifactDescriptor;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/create", post(retrieve))
        .route("/{tag}/{name}", get(download))
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RetrieveRequest {
    #[serde(rename = "imagename")]
    pub image_name: String,
}

/// POST /create
async fn retrieve(
    State(state): State<AppState>,
    payload: Result<Json<RetrieveRequest>, JsonRejection>,
) -> Result<Json<ArtifactDescriptor>, ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError::bad_request("invalid_request", e.body_text()))?;

    match state.content().retrieve_content(&request.image_name).await {
        Ok(content) => {
            info!(
                image = %request.image_name,
                release = %content.release,
                cached = content.was_cached,
                "Release content ready"
            );
            Ok(Json(content.descriptor))
        }
        Err(e) => {
            warn!(image = %request.image_name, error = %e, "Release retrieval failed");
            Err(ApiError::from_retrieve(&e))
        }
    }
}

/// GET /{tag}/{name}
async fn download(
    State(state): State<AppState>,
    Path((tag, name)): Path<(String, String)>,
    request: Request,
) -> Result<Response, ApiError> {
    let path = state
        .content()
        .get_binaries(&name, &tag)
        .map_err(|_| ApiError::not_found("file_not_found", "File not found"))?;

    let response = match ServeFile::new(&path).oneshot(request).await {
        Ok(response) => response.map(Body::new),
        Err(never) => match never {},
    };

    if response.status() == StatusCode::NOT_FOUND {
        warn!(path = %path.display(), "Cached release points at a missing file");
        return Err(ApiError::not_found("file_missing", "File not found"));
    }

    let mut response = response;
    if response.status().is_success() {
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
            .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    Ok(response)
}
