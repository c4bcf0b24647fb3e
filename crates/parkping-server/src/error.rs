use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Failures reported back to a connection through its `ack`.
///
/// These never escape the hub task: every handler turns them into an
/// `Ack { success: false, message }`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HubError {
    #[error("Wrong secret for this id")]
    InvalidCredential,

    #[error("This id has been blocked by an administrator")]
    AccountBlocked,

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors of the HTTP surface.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Hub unavailable")]
    HubUnavailable,
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::HubUnavailable => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}
