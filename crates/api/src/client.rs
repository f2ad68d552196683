//! HTTP client for the publish endpoint.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::app::dto::{ErrorBody, PublishRequest, PublishResponse};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("encode payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("rejected ({status}): {code}: {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Skip TLS certificate verification (self-signed dev servers).
    pub accept_invalid_certs: bool,
    /// Bearer token sent with every publish.
    pub token: Option<String>,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            accept_invalid_certs: false,
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ClientConfig {
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.accept_invalid_certs = accept;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl Client {
    /// `base_url` e.g. `"https://localhost:9101"`.
    pub fn new(base_url: impl Into<String>, config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: config.token,
        })
    }

    /// Encode `data` as the payload of an event called `name` and publish it.
    pub async fn send<T>(&self, name: &str, data: &T) -> Result<(), ClientError>
    where
        T: Serialize + ?Sized,
    {
        let request = PublishRequest {
            name: name.to_string(),
            data: serde_json::to_value(data)?,
        };

        let mut builder = self
            .http
            .post(format!("{}/publish", self.base_url))
            .json(&request);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }

        let res = builder.send().await?;
        let status = res.status();

        if status.is_success() {
            let body: PublishResponse = res.json().await?;
            debug!(event_name = name, ok = body.ok, "sent event");
            return Ok(());
        }

        let text = res.text().await?;
        let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => (body.error, body.message),
            Err(_) => (status.canonical_reason().unwrap_or("error").to_string(), text),
        };

        Err(ClientError::Rejected {
            status: status.as_u16(),
            code,
            message,
        })
    }
}
