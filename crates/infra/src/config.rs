//! Process configuration from `EVENTMILL_*` environment variables.
//!
//! | variable                       | meaning                                         | default        |
//! |--------------------------------|-------------------------------------------------|----------------|
//! | `EVENTMILL_ADDRESS`            | RPC listen address                              | `0.0.0.0:9101` |
//! | `EVENTMILL_CERT` / `_CERT_KEY` | TLS certificate and key (both or neither)       | plain HTTP     |
//! | `EVENTMILL_LOG_LEVEL`          | tracing level                                   | `info`         |
//! | `EVENTMILL_STREAM`             | log stream to publish to and tail               | **required**   |
//! | `EVENTMILL_SHARD_PATH`         | checkpoint key prefix                           | `/eventmill`   |
//! | `EVENTMILL_REDIS_URL`          | Redis for the log, queue or checkpoints         | in-memory log  |
//! | `EVENTMILL_DATABASE_URL`       | Postgres for checkpoints                        |                |
//! | `EVENTMILL_CHECKPOINT_BACKEND` | `memory`, `redis` or `postgres`                 | `memory`       |
//! | `EVENTMILL_MAX_JOBS`           | positive integer or `unbounded`                 | **required**   |
//! | `EVENTMILL_DRAIN_TIMEOUT_MS`   | task drain budget on stop                       | **required**   |
//! | `EVENTMILL_ADVANCE_POLICY`     | `always` or `on-emit`                           | `on-emit`      |
//! | `EVENTMILL_TOPIC` / `_CHANNEL` | queue subscription (switches to queue consumer) |                |
//! | `EVENTMILL_HANDLER_COUNT`      | queue delivery handlers                         | 4              |
//! | `EVENTMILL_MAX_IN_FLIGHT`      | queue outstanding deliveries                    | 4              |
//! | `EVENTMILL_AUTH_SECRET`        | HS256 secret; enables bearer auth on publish    | auth off       |

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use eventmill_events::JobLimit;

use crate::consumer::AdvancePolicy;

pub const ENV_PREFIX: &str = "EVENTMILL_";

const DEFAULT_ADDRESS: &str = "0.0.0.0:9101";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_SHARD_PATH: &str = "/eventmill";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl fmt::Display) -> Self {
        Self::Invalid {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }

    fn missing(key: &str) -> Self {
        Self::Missing(format!("{ENV_PREFIX}{key}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointBackend {
    #[default]
    Memory,
    Redis,
    Postgres,
}

impl FromStr for CheckpointBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "in-memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            "postgres" | "postgresql" => Ok(Self::Postgres),
            other => Err(format!("unknown checkpoint backend: {other}")),
        }
    }
}

/// Queue subscription; present when both topic and channel are configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub topic: String,
    pub channel: String,
    pub handler_count: usize,
    pub max_in_flight: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsSettings {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub address: SocketAddr,
    pub tls: Option<TlsSettings>,
    pub log_level: String,
    pub stream: String,
    pub shard_path: String,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub checkpoint_backend: CheckpointBackend,
    pub max_jobs: JobLimit,
    pub drain_timeout: Duration,
    pub advance_policy: AdvancePolicy,
    pub queue: Option<QueueSettings>,
    pub auth_secret: Option<String>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read settings through `lookup`, which receives full variable names.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| get(key).ok_or_else(|| ConfigError::missing(key));

        let address_raw = get("ADDRESS").unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
        let address = address_raw
            .parse()
            .map_err(|e| ConfigError::invalid("ADDRESS", &address_raw, e))?;

        let tls = match (get("CERT"), get("CERT_KEY")) {
            (Some(cert), Some(key)) => Some(TlsSettings {
                cert: cert.into(),
                key: key.into(),
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::missing("CERT_KEY")),
            (None, Some(_)) => return Err(ConfigError::missing("CERT")),
        };

        let max_jobs_raw = require("MAX_JOBS")?;
        let max_jobs = parse_job_limit(&max_jobs_raw)
            .ok_or_else(|| ConfigError::invalid("MAX_JOBS", &max_jobs_raw, "expected a positive integer or \"unbounded\""))?;

        let drain_raw = require("DRAIN_TIMEOUT_MS")?;
        let drain_timeout = drain_raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| ConfigError::invalid("DRAIN_TIMEOUT_MS", &drain_raw, e))?;

        let advance_policy = match get("ADVANCE_POLICY") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::invalid("ADVANCE_POLICY", &raw, e))?,
            None => AdvancePolicy::default(),
        };

        let checkpoint_backend = match get("CHECKPOINT_BACKEND") {
            Some(raw) => raw
                .parse()
                .map_err(|e: String| ConfigError::invalid("CHECKPOINT_BACKEND", &raw, e))?,
            None => CheckpointBackend::default(),
        };

        let redis_url = get("REDIS_URL");
        let database_url = get("DATABASE_URL");
        match checkpoint_backend {
            CheckpointBackend::Redis if redis_url.is_none() => {
                return Err(ConfigError::missing("REDIS_URL"));
            }
            CheckpointBackend::Postgres if database_url.is_none() => {
                return Err(ConfigError::missing("DATABASE_URL"));
            }
            _ => {}
        }

        let count = |key: &str| -> Result<usize, ConfigError> {
            match get(key) {
                Some(raw) => raw.parse().map_err(|e| ConfigError::invalid(key, &raw, e)),
                None => Ok(0),
            }
        };

        let queue = match (get("TOPIC"), get("CHANNEL")) {
            (Some(topic), Some(channel)) => Some(QueueSettings {
                topic,
                channel,
                handler_count: count("HANDLER_COUNT")?,
                max_in_flight: count("MAX_IN_FLIGHT")?,
            }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::missing("CHANNEL")),
            (None, Some(_)) => return Err(ConfigError::missing("TOPIC")),
        };

        Ok(Self {
            address,
            tls,
            log_level: get("LOG_LEVEL").unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
            stream: require("STREAM")?,
            shard_path: get("SHARD_PATH").unwrap_or_else(|| DEFAULT_SHARD_PATH.to_string()),
            redis_url,
            database_url,
            checkpoint_backend,
            max_jobs,
            drain_timeout,
            advance_policy,
            queue,
            auth_secret: get("AUTH_SECRET"),
        })
    }
}

/// `"unbounded"` or a positive integer; zero has no meaning.
pub fn parse_job_limit(raw: &str) -> Option<JobLimit> {
    if raw.trim().eq_ignore_ascii_case("unbounded") {
        return Some(JobLimit::Unbounded);
    }
    raw.trim().parse::<usize>().ok().and_then(JobLimit::bounded)
}
