use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use fieldstock_infra::{ErrorKind, OperationError};

pub fn operation_error_to_response(err: OperationError) -> axum::response::Response {
    let status = match err.kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict | ErrorKind::Concurrency => StatusCode::CONFLICT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    // Store details were logged where they happened.
    let message = match err.kind {
        ErrorKind::Internal => "internal error".to_string(),
        _ => err.message,
    };
    json_error(status, err.kind.as_str(), message)
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

pub fn invalid_id(what: &str) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "validation", format!("invalid {what} id"))
}
