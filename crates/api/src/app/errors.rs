use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use eventmill_infra::ProducerError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("no event")]
    NoEvent,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("publish failed: {0}")]
    Publish(#[from] ProducerError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NoEvent => json_error(StatusCode::BAD_REQUEST, "no_event", "no event"),
            ApiError::InvalidRequest(msg) => {
                json_error(StatusCode::BAD_REQUEST, "invalid_request", msg)
            }
            ApiError::Publish(ProducerError::Codec(e)) => {
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "codec_error", e.to_string())
            }
            ApiError::Publish(e) => json_error(StatusCode::BAD_GATEWAY, "publish_error", e.to_string()),
        }
    }
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
