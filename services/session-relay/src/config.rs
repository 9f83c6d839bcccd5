//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The bootstrap refresh token is loaded from RELAY_REFRESH_TOKEN or
//! refresh_token_file, never stored in the TOML directly to avoid leaking
//! secrets.

use common::Secret;
use realtime_channel::{BackoffPolicy, ChannelConfig};
use request_pipeline::PipelineConfig;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Env var holding a refresh token to start the session with.
pub const REFRESH_TOKEN_ENV: &str = "RELAY_REFRESH_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub relay: RelayConfig,
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    pub channel: ChannelSettings,
    #[serde(default)]
    pub mock: MockConfig,
}

/// Which transports the relay is built on. Chosen once at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Live,
    Mock,
}

/// Listener settings
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Dashboard API settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_ms: u64,
    #[serde(default = "default_refresh_skew")]
    pub refresh_skew_secs: u64,
}

/// Credential persistence and proactive refresh
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_credential_file")]
    pub credential_file: PathBuf,
    #[serde(skip)]
    pub refresh_token: Option<Secret<String>>,
    /// Path to a file containing a bootstrap refresh token
    #[serde(default)]
    pub refresh_token_file: Option<PathBuf>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credential_file: default_credential_file(),
            refresh_token: None,
            refresh_token_file: None,
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

/// Realtime channel settings
#[derive(Debug, Deserialize)]
pub struct ChannelSettings {
    pub url: String,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
    /// Domain events forwarded to `/events`
    #[serde(default)]
    pub events: Vec<String>,
}

/// Mock-mode settings
#[derive(Debug, Deserialize)]
pub struct MockConfig {
    #[serde(default = "default_mock_latency")]
    pub latency_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency_ms: default_mock_latency(),
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_auth_timeout() -> u64 {
    session_auth::DEFAULT_AUTH_TIMEOUT_MS
}

fn default_refresh_skew() -> u64 {
    60
}

fn default_credential_file() -> PathBuf {
    PathBuf::from(session_auth::DEFAULT_CREDENTIAL_FILE)
}

fn default_refresh_interval() -> u64 {
    60
}

fn default_refresh_threshold() -> u64 {
    300
}

fn default_base_delay() -> u64 {
    2000
}

fn default_max_delay() -> u64 {
    32000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_handshake_timeout() -> u64 {
    20_000
}

fn default_mock_latency() -> u64 {
    50
}

fn require_nonzero(name: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!("{name} must be greater than 0")));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// Bootstrap refresh token resolution order:
    /// 1. RELAY_REFRESH_TOKEN env var
    /// 2. refresh_token_file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;

        if let Ok(token) = std::env::var(REFRESH_TOKEN_ENV) {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.refresh_token = Some(Secret::new(token));
            }
        } else if let Some(ref token_file) = config.session.refresh_token_file {
            let token = std::fs::read_to_string(token_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read refresh_token_file {}: {e}",
                    token_file.display()
                ))
            })?;
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.refresh_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }
        if !self.channel.url.starts_with("ws://") && !self.channel.url.starts_with("wss://") {
            return Err(common::Error::Config(format!(
                "channel url must start with ws:// or wss://, got: {}",
                self.channel.url
            )));
        }

        require_nonzero("max_connections", self.relay.max_connections as u64)?;
        require_nonzero("request_timeout_secs", self.api.request_timeout_secs)?;
        require_nonzero("auth_timeout_ms", self.api.auth_timeout_ms)?;
        require_nonzero("refresh_interval_secs", self.session.refresh_interval_secs)?;
        require_nonzero("base_delay_ms", self.channel.base_delay_ms)?;
        require_nonzero("max_delay_ms", self.channel.max_delay_ms)?;
        require_nonzero("max_attempts", u64::from(self.channel.max_attempts))?;
        require_nonzero("handshake_timeout_ms", self.channel.handshake_timeout_ms)?;

        if self.channel.base_delay_ms > self.channel.max_delay_ms {
            return Err(common::Error::Config(format!(
                "base_delay_ms ({}) exceeds max_delay_ms ({})",
                self.channel.base_delay_ms, self.channel.max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            request_timeout: Duration::from_secs(self.api.request_timeout_secs),
            auth_timeout: Duration::from_millis(self.api.auth_timeout_ms),
            refresh_skew: Duration::from_secs(self.api.refresh_skew_secs),
        }
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.channel.base_delay_ms),
                max_delay: Duration::from_millis(self.channel.max_delay_ms),
                max_attempts: self.channel.max_attempts,
            },
            handshake_timeout: Duration::from_millis(self.channel.handshake_timeout_ms),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("session-relay.toml")
    }
}
