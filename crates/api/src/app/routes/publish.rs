use axum::{
    Extension, Json,
    body::Bytes,
    extract::State,
};
use tracing::{debug, warn};

use crate::app::{
    AppState,
    dto::{PublishRequest, PublishResponse},
    errors::ApiError,
};
use crate::middleware::Claims;

/// POST /publish
///
/// Body: `{"name": "...", "data": <any JSON>}`. The event is written once through
/// the configured producer; there is no retry here.
pub async fn publish(
    State(state): State<AppState>,
    claims: Option<Extension<Claims>>,
    body: Bytes,
) -> Result<Json<PublishResponse>, ApiError> {
    let request = PublishRequest::from_body(&body)?;
    let event = request.into_event()?;

    if let Err(e) = state.producer.publish(&event).await {
        warn!(event_name = event.name(), error = %e, "couldn't publish event");
        return Err(e.into());
    }

    debug!(
        event_name = event.name(),
        subject = claims.as_ref().map(|Extension(c)| c.sub.as_str()),
        "published event"
    );
    Ok(Json(PublishResponse { ok: true }))
}
