//! HTTP application wiring (Axum router + shared state).
//!
//! - `routes/`: handlers
//! - `dto.rs`: request/response bodies
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Router, routing::get};
use tower::ServiceBuilder;

use eventmill_infra::Producer;

use crate::middleware::{self, AuthState};

pub mod dto;
pub mod errors;
pub mod routes;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub producer: Arc<dyn Producer>,
    pub auth: Option<AuthState>,
}

impl AppState {
    pub fn new(producer: Arc<dyn Producer>) -> Self {
        Self {
            producer,
            auth: None,
        }
    }

    /// Require an HS256 bearer token signed with `secret` on publish.
    pub fn with_auth_secret(mut self, secret: impl AsRef<[u8]>) -> Self {
        self.auth = Some(AuthState::hs256(secret.as_ref()));
        self
    }
}

/// Build the full HTTP router (used by the server binary and the black-box tests).
pub fn build_app(state: AppState) -> Router {
    let mut publish = routes::router();
    if let Some(auth) = state.auth.clone() {
        publish = publish.route_layer(axum::middleware::from_fn_with_state(
            auth,
            middleware::auth_middleware,
        ));
    }

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(publish)
        .layer(ServiceBuilder::new())
        .with_state(state)
}
