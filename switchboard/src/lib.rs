use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;

pub mod auth;
pub mod availability;
pub mod collection;
pub mod db;
pub mod fabric;
pub mod jobs;
pub mod logger;
pub mod media;
pub mod payments;
pub mod purchase;
pub mod routes;
pub mod schema;
pub mod session;
pub mod settings;
pub mod ws;

/// HTTP-facing error taxonomy. User-driven operations surface these; the
/// engine-internal paths (timer ticks, webhook retries) log and retry
/// instead of converting to a response.
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    /// Payment adapter or media token issuer failure; local state unchanged.
    Upstream(String),
    InternalServerError(String),
}

impl From<diesel::result::Error> for AppError {
    fn from(e: diesel::result::Error) -> Self {
        AppError::InternalServerError(format!("Database error: {e}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            AppError::Unauthorized(message) => (StatusCode::UNAUTHORIZED, message),
            AppError::Forbidden(message) => (StatusCode::FORBIDDEN, message),
            AppError::NotFound(message) => (StatusCode::NOT_FOUND, message),
            AppError::Conflict(message) => (StatusCode::CONFLICT, message),
            AppError::Upstream(message) => (StatusCode::BAD_GATEWAY, message),
            AppError::InternalServerError(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };

        (
            status,
            axum::Json(serde_json::json!({ "error": message })),
        )
            .into_response()
    }
}
