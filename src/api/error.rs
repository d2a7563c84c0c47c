use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Structured JSON error body used for every response except `Internal`.
#[derive(Serialize)]
pub struct ApiErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Unified application error type.
///
/// Both variants render as structured JSON. `BadRequest` is returned by
/// handlers that reject malformed input (see `api::require_mac`);
/// `MethodNotAllowed` is wired in as the per-route fallback in
/// `api::router` for every route that only accepts one HTTP method.
pub enum AppError {
    BadRequest(String),
    MethodNotAllowed,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::BadRequest(msg) => {
                (StatusCode::BAD_REQUEST, Json(ApiErrorBody { code: "bad_request", message: msg }))
                    .into_response()
            }
            AppError::MethodNotAllowed => (
                StatusCode::METHOD_NOT_ALLOWED,
                Json(ApiErrorBody {
                    code: "method_not_allowed",
                    message: "method not allowed".to_string(),
                }),
            )
                .into_response(),
        }
    }
}
