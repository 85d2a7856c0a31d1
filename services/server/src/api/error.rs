use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::extract::ExtractError;
use crate::service::ContentError;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("about:blank#{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    /// Any retrieval failure is reported to the caller as a bad request.
    pub fn from_retrieve(err: &ContentError) -> Self {
        Self::bad_request(content_error_code(err), err.to_string())
    }
}

fn content_error_code(err: &ContentError) -> &'static str {
    match err {
        ContentError::Reference(_) => "invalid_reference",
        ContentError::Registry(_) | ContentError::Extract(ExtractError::Registry(_)) => {
            "image_fetch_failed"
        }
        ContentError::MissingReleaseLabel => "missing_release_label",
        ContentError::Extract(ExtractError::ReleaseTagFormat { .. }) => "invalid_release_tag",
        ContentError::Extract(ExtractError::ArtifactsNotFound { .. }) => "artifacts_not_found",
        ContentError::Extract(_) => "extraction_failed",
        ContentError::StaleCacheEntry { .. } => "stale_cache_entry",
        ContentError::NotFound(_) => "not_found",
        ContentError::Io { .. } | ContentError::Task(_) => "internal_error",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}
