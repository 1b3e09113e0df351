// Configuration for the relay server

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use provider_core::{UpstreamConfig, DEFAULT_UPSTREAM_URL};
use stream_core::{DEFAULT_MAX_BUFFERED_BYTES, DEFAULT_MODEL};

/// Which browser-facing surfaces are mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeMode {
    /// Backend holds the provider connection and relays audio over `/ws`
    Relay,
    /// Browser fetches a credential from `/api/token` and connects itself
    Direct,
    Both,
}

impl ServeMode {
    pub fn serves_relay(&self) -> bool {
        matches!(self, ServeMode::Relay | ServeMode::Both)
    }

    pub fn serves_direct(&self) -> bool {
        matches!(self, ServeMode::Direct | ServeMode::Both)
    }

    /// Label reported by the health endpoint.
    pub fn approach(&self) -> &'static str {
        match self {
            ServeMode::Relay => "backend-relay",
            ServeMode::Direct => "direct-connection",
            ServeMode::Both => "relay-and-direct",
        }
    }
}

impl FromStr for ServeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relay" => Ok(ServeMode::Relay),
            "direct" => Ok(ServeMode::Direct),
            "both" => Ok(ServeMode::Both),
            other => bail!("unknown STREAM_MODE '{other}' (expected relay, direct or both)"),
        }
    }
}

#[derive(Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub mode: ServeMode,
    pub api_key: String,
    pub upstream_url: String,
    pub default_model: String,
    pub queue_max_bytes: usize,
    pub upstream_connect_timeout_secs: u64,
    pub upstream_frame_timeout_secs: u64,
    pub session_timeout_secs: u64,
    pub close_grace_ms: u64,
    pub send_timeout_secs: u64,
    pub token_ttl_secs: u64,
    pub rate_limit_per_minute: u32,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            mode: ServeMode::Both,
            api_key: String::new(),
            upstream_url: DEFAULT_UPSTREAM_URL.to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            queue_max_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            upstream_connect_timeout_secs: 10,
            upstream_frame_timeout_secs: 10,
            session_timeout_secs: 60,
            close_grace_ms: 2000,
            send_timeout_secs: 10,
            token_ttl_secs: 30,
            rate_limit_per_minute: 60,
            request_timeout_secs: 30,
            cors_allowed_origins: None,
        }
    }
}

// The API key never reaches the logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("port", &self.port)
            .field("mode", &self.mode)
            .field("api_key", &"<redacted>")
            .field("upstream_url", &self.upstream_url)
            .field("default_model", &self.default_model)
            .field("queue_max_bytes", &self.queue_max_bytes)
            .field("session_timeout_secs", &self.session_timeout_secs)
            .field("rate_limit_per_minute", &self.rate_limit_per_minute)
            .finish_non_exhaustive()
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();

        let api_key = std::env::var("DEEPGRAM_API_KEY")
            .context("DEEPGRAM_API_KEY environment variable not set")?;
        if api_key.trim().is_empty() {
            bail!("DEEPGRAM_API_KEY is empty");
        }

        let mode = match std::env::var("STREAM_MODE") {
            Ok(value) => value.parse()?,
            Err(_) => defaults.mode,
        };

        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .ok()
            .map(|origins| {
                origins
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            });

        Ok(Self {
            port: env_or("PORT", defaults.port),
            mode,
            api_key,
            upstream_url: std::env::var("UPSTREAM_URL").unwrap_or(defaults.upstream_url),
            default_model: std::env::var("TTS_MODEL").unwrap_or(defaults.default_model),
            queue_max_bytes: env_or("QUEUE_MAX_BYTES", defaults.queue_max_bytes),
            upstream_connect_timeout_secs: env_or(
                "UPSTREAM_CONNECT_TIMEOUT_SECS",
                defaults.upstream_connect_timeout_secs,
            ),
            upstream_frame_timeout_secs: env_or("UPSTREAM_FRAME_TIMEOUT_SECS", defaults.upstream_frame_timeout_secs),
            session_timeout_secs: env_or("SESSION_TIMEOUT_SECS", defaults.session_timeout_secs),
            close_grace_ms: env_or("CLOSE_GRACE_MS", defaults.close_grace_ms),
            send_timeout_secs: env_or("SEND_TIMEOUT_SECS", defaults.send_timeout_secs),
            token_ttl_secs: env_or("TOKEN_TTL_SECS", defaults.token_ttl_secs),
            rate_limit_per_minute: env_or("RATE_LIMIT_PER_MINUTE", defaults.rate_limit_per_minute),
            request_timeout_secs: env_or("REQUEST_TIMEOUT_SECS", defaults.request_timeout_secs),
            cors_allowed_origins,
        })
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            url: self.upstream_url.clone(),
            connect_timeout: Duration::from_secs(self.upstream_connect_timeout_secs),
            frame_timeout: Duration::from_secs(self.upstream_frame_timeout_secs),
            close_grace: self.close_grace(),
            ..UpstreamConfig::default()
        }
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
