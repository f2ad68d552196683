use axum::{Router, routing::post};

use crate::app::AppState;

pub mod publish;
pub mod system;

/// Endpoints that sit behind authentication when it is configured.
pub fn router() -> Router<AppState> {
    Router::new().route("/publish", post(publish::publish))
}
