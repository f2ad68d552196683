use serde::{Deserialize, Serialize};
use serde_json::Value;

use eventmill_core::Event;

use crate::app::errors::ApiError;

// -------------------------
// Request DTOs
// -------------------------

/// Event as it travels over HTTP. `data` is any JSON value and becomes the event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

impl PublishRequest {
    /// Parse a publish body. An empty body or a JSON `null` carries no event.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(ApiError::NoEvent);
        }

        let value: Value =
            serde_json::from_slice(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        if value.is_null() {
            return Err(ApiError::NoEvent);
        }

        serde_json::from_value(value).map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }

    /// Build the event. A `null` payload becomes an empty one.
    pub fn into_event(self) -> Result<Event, ApiError> {
        if self.name.trim().is_empty() {
            return Err(ApiError::InvalidRequest("event name is empty".to_string()));
        }

        if self.data.is_null() {
            return Ok(Event::new(self.name, Vec::new()));
        }

        Event::with_data(self.name, &self.data)
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))
    }
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub ok: bool,
}

/// Body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}
