use directories::BaseDirs;
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::gateway::Credentials;
use crate::relay::retry::{DelaySchedule, ExponentialBackoff, RetryPolicy};

pub const DEFAULT_API_BASE_URL: &str = "http://taxx.runasp.net";
pub const DEFAULT_AUTH_BASE_URL: &str = "https://innalok.faridasadli.com/api";
const DEFAULT_RECONNECT_DELAYS_MS: [u64; 4] = [0, 2_000, 10_000, 30_000];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid url in {var}: {source}")]
    InvalidUrl {
        var: &'static str,
        source: url::ParseError,
    },
    #[error("{var} must use http or https, got {scheme}")]
    UnsupportedScheme { var: &'static str, scheme: String },
    #[error("could not determine a home directory; set INNALOK_STATE_DIR")]
    NoStateDir,
    #[error("INNALOK_RECONNECT_POLICY must be `schedule` or `backoff`, got {0}")]
    UnknownReconnectPolicy(String),
}

/// How the relay spaces out reconnect attempts after the hub drops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconnectPolicy {
    /// `reconnect_delays`, one per attempt.
    #[default]
    Schedule,
    /// [`ExponentialBackoff::default`].
    Backoff,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_base_url: Url,
    pub auth_base_url: Url,
    pub state_dir: PathBuf,
    pub health_interval: Duration,
    pub http_timeout: Duration,
    pub reconnect_delays: Vec<Duration>,
    pub reconnect_policy: ReconnectPolicy,
    pub terminal_credentials: Credentials,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let seconds = |key: &str, default: u64| {
            let secs = var(key)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(default);
            Duration::from_secs(secs)
        };

        let api_base_url = parse_base_url(
            "INNALOK_API_BASE_URL",
            var("INNALOK_API_BASE_URL").as_deref(),
            DEFAULT_API_BASE_URL,
        )?;
        let auth_base_url = parse_base_url(
            "INNALOK_AUTH_BASE_URL",
            var("INNALOK_AUTH_BASE_URL").as_deref(),
            DEFAULT_AUTH_BASE_URL,
        )?;
        let state_dir = match var("INNALOK_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => BaseDirs::new()
                .map(|dirs| dirs.home_dir().join(".innalok"))
                .ok_or(ConfigError::NoStateDir)?,
        };
        let reconnect_delays = var("INNALOK_RECONNECT_DELAYS_MS")
            .and_then(|raw| parse_delays(&raw))
            .unwrap_or_else(|| {
                DEFAULT_RECONNECT_DELAYS_MS
                    .iter()
                    .map(|ms| Duration::from_millis(*ms))
                    .collect()
            });

        let reconnect_policy = match var("INNALOK_RECONNECT_POLICY").as_deref() {
            None | Some("schedule") => ReconnectPolicy::Schedule,
            Some("backoff") => ReconnectPolicy::Backoff,
            Some(other) => return Err(ConfigError::UnknownReconnectPolicy(other.to_string())),
        };

        let defaults = Credentials::default();
        Ok(Self {
            api_base_url,
            auth_base_url,
            state_dir,
            health_interval: seconds("INNALOK_HEALTH_INTERVAL_SECS", 30),
            http_timeout: seconds("INNALOK_HTTP_TIMEOUT_SECS", 8),
            reconnect_delays,
            reconnect_policy,
            terminal_credentials: Credentials {
                name: var("INNALOK_TERMINAL_USER").unwrap_or(defaults.name),
                password: var("INNALOK_TERMINAL_PASSWORD").unwrap_or(defaults.password),
            },
        })
    }
}

impl Config {
    pub fn retry_policy(&self) -> Arc<dyn RetryPolicy> {
        match self.reconnect_policy {
            ReconnectPolicy::Schedule => Arc::new(DelaySchedule::new(self.reconnect_delays.clone())),
            ReconnectPolicy::Backoff => Arc::new(ExponentialBackoff::default()),
        }
    }
}

fn parse_base_url(var: &'static str, value: Option<&str>, default: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(value.unwrap_or(default))
        .map_err(|source| ConfigError::InvalidUrl { var, source })?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ConfigError::UnsupportedScheme {
            var,
            scheme: other.to_string(),
        }),
    }
}

/// Comma separated milliseconds, e.g. `0,2000,10000`. Any unparsable entry
/// discards the whole list.
fn parse_delays(raw: &str) -> Option<Vec<Duration>> {
    raw.split(',')
        .map(|part| part.trim().parse::<u64>().ok().map(Duration::from_millis))
        .collect()
}

/// Joins `path` onto `base`, keeping any path prefix already on the base url.
pub fn api_endpoint(base: &Url, path: &str) -> Result<Url, url::ParseError> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let with_slash = format!("{}/", base.path());
        base.set_path(&with_slash);
    }
    base.join(path.trim_start_matches('/'))
}
