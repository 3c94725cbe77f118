//! Client configuration.
//!
//! Unlike the teacher's `forwarder::config` (TOML file, validated at load
//! time), this is a library: callers build an [`RtuConfig`] in-process via
//! [`RtuConfig::builder`]. The validation shape is the same — required
//! fields checked at `build()`, defaults applied for the rest, bearer token
//! falls back to an environment variable when not set explicitly.

use std::env;
use std::time::Duration;

/// The kind of client presenting itself during authentication, sent as
/// `rtu_client_type`. Anything not in this list is sent as `unknown` rather
/// than rejected, since the server treats it as informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreatorClientType {
    Origami,
    Origamist,
    PlanarAlly,
    Geas,
    Unknown,
}

impl CreatorClientType {
    pub fn as_wire_str(self) -> &'static str {
        match self {
            CreatorClientType::Origami => "origami",
            CreatorClientType::Origamist => "origamist",
            CreatorClientType::PlanarAlly => "planar_ally",
            CreatorClientType::Geas => "geas",
            CreatorClientType::Unknown => "unknown",
        }
    }
}

impl From<&str> for CreatorClientType {
    fn from(s: &str) -> Self {
        match s {
            "origami" => CreatorClientType::Origami,
            "origamist" => CreatorClientType::Origamist,
            "planar_ally" => CreatorClientType::PlanarAlly,
            "geas" => CreatorClientType::Geas,
            _ => CreatorClientType::Unknown,
        }
    }
}

/// Name of the environment variable consulted when no token is supplied
/// explicitly to the builder.
pub const TOKEN_ENV_VAR: &str = "NOTEABLE_TOKEN";

#[derive(Debug, Clone)]
pub struct RtuConfig {
    pub api_base_url: String,
    pub authorization_token: String,
    pub file_subscribe_timeout: Duration,
    pub creator_client_type: CreatorClientType,
    pub authenticate_timeout: Duration,
    pub reconnect_backoff_base_ms: u64,
    pub reconnect_backoff_cap_ms: u64,
    pub log_span_events: bool,
}

impl RtuConfig {
    pub fn builder(api_base_url: impl Into<String>) -> RtuConfigBuilder {
        RtuConfigBuilder::new(api_base_url)
    }

    /// The websocket RTU endpoint derived from `api_base_url`: scheme
    /// `http`/`https` becomes `ws`/`wss`, and `/v1/rtu` is appended.
    pub fn rtu_url(&self) -> String {
        let ws_base = if let Some(rest) = self.api_base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.api_base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.api_base_url.clone()
        };
        let ws_base = ws_base.trim_end_matches('/');
        format!("{ws_base}/v1/rtu")
    }
}

#[derive(Debug, Default)]
pub struct RtuConfigBuilder {
    api_base_url: String,
    authorization_token: Option<String>,
    file_subscribe_timeout: Option<Duration>,
    creator_client_type: Option<CreatorClientType>,
    authenticate_timeout: Option<Duration>,
    reconnect_backoff_base_ms: Option<u64>,
    reconnect_backoff_cap_ms: Option<u64>,
    log_span_events: Option<bool>,
}

impl RtuConfigBuilder {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            ..Default::default()
        }
    }

    pub fn authorization_token(mut self, token: impl Into<String>) -> Self {
        self.authorization_token = Some(token.into());
        self
    }

    pub fn file_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.file_subscribe_timeout = Some(timeout);
        self
    }

    pub fn creator_client_type(mut self, kind: CreatorClientType) -> Self {
        self.creator_client_type = Some(kind);
        self
    }

    pub fn authenticate_timeout(mut self, timeout: Duration) -> Self {
        self.authenticate_timeout = Some(timeout);
        self
    }

    pub fn reconnect_backoff(mut self, base_ms: u64, cap_ms: u64) -> Self {
        self.reconnect_backoff_base_ms = Some(base_ms);
        self.reconnect_backoff_cap_ms = Some(cap_ms);
        self
    }

    pub fn log_span_events(mut self, enabled: bool) -> Self {
        self.log_span_events = Some(enabled);
        self
    }

    /// Validates required fields and applies defaults, falling back to
    /// `NOTEABLE_TOKEN` for the bearer token when none was set explicitly.
    pub fn build(self) -> Result<RtuConfig, ConfigError> {
        if self.api_base_url.trim().is_empty() {
            return Err(ConfigError::MissingField("api_base_url".to_owned()));
        }

        let authorization_token = match self.authorization_token {
            Some(token) => token,
            None => env::var(TOKEN_ENV_VAR)
                .map_err(|_| ConfigError::MissingField("authorization_token".to_owned()))?,
        };
        if authorization_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "authorization_token must not be empty".to_owned(),
            ));
        }

        let config = RtuConfig {
            api_base_url: self.api_base_url,
            authorization_token,
            file_subscribe_timeout: self
                .file_subscribe_timeout
                .unwrap_or(Duration::from_secs(10)),
            creator_client_type: self.creator_client_type.unwrap_or(CreatorClientType::Unknown),
            authenticate_timeout: self
                .authenticate_timeout
                .unwrap_or(Duration::from_secs(10)),
            reconnect_backoff_base_ms: self.reconnect_backoff_base_ms.unwrap_or(500),
            reconnect_backoff_cap_ms: self.reconnect_backoff_cap_ms.unwrap_or(30_000),
            log_span_events: self.log_span_events.unwrap_or(false),
        };
        tracing::debug!(url = %config.rtu_url(), "rtu config validated");
        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(String),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}
