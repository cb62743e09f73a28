//! Process configuration from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

const DEV_WEBHOOK_SECRET: &str = "dev-webhook-secret";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}

/// Kapso API settings; absent means the stub provider is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KapsoSettings {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub webhook_secret: String,
    /// `None` runs with in-memory stores.
    pub database_url: Option<String>,
    pub kapso: Option<KapsoSettings>,
    pub provider_timeout: Duration,
    pub rate_limit_per_window: u32,
    pub rate_limit_window: Duration,
    pub job_poll_interval: Duration,
    /// `None` disables stale-lease recovery.
    pub job_stale_after: Option<Duration>,
    pub dev_mode: bool,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let dev_mode = match var("DEV_MODE") {
            Some(v) => parse_bool("DEV_MODE", &v)?,
            None => false,
        };

        let bind_addr = match var("BIND_ADDR") {
            Some(v) => v.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                name: "BIND_ADDR",
                reason: e.to_string(),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let webhook_secret = match var("WEBHOOK_SECRET") {
            Some(secret) => secret,
            None if dev_mode => {
                tracing::warn!("WEBHOOK_SECRET not set; using insecure dev default");
                DEV_WEBHOOK_SECRET.to_string()
            }
            None => return Err(ConfigError::Missing("WEBHOOK_SECRET")),
        };

        let kapso = match (var("KAPSO_API_URL"), var("KAPSO_API_KEY")) {
            (Some(base_url), Some(api_key)) => Some(KapsoSettings { base_url, api_key }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("KAPSO_API_KEY")),
            (None, Some(_)) => return Err(ConfigError::Missing("KAPSO_API_URL")),
        };

        let stale_secs = parse_u64("JOB_STALE_AFTER_SECS", var("JOB_STALE_AFTER_SECS"), 600)?;

        Ok(Self {
            bind_addr,
            webhook_secret,
            database_url: var("DATABASE_URL"),
            kapso,
            provider_timeout: Duration::from_secs(parse_u64(
                "PROVIDER_TIMEOUT_SECS",
                var("PROVIDER_TIMEOUT_SECS"),
                15,
            )?),
            rate_limit_per_window: parse_u64(
                "RATE_LIMIT_PER_WINDOW",
                var("RATE_LIMIT_PER_WINDOW"),
                60,
            )?
            .try_into()
            .map_err(|_| ConfigError::Invalid {
                name: "RATE_LIMIT_PER_WINDOW",
                reason: "too large".to_string(),
            })?,
            rate_limit_window: Duration::from_secs(positive(
                "RATE_LIMIT_WINDOW_SECS",
                parse_u64("RATE_LIMIT_WINDOW_SECS", var("RATE_LIMIT_WINDOW_SECS"), 60)?,
            )?),
            job_poll_interval: Duration::from_secs(positive(
                "JOB_POLL_INTERVAL_SECS",
                parse_u64("JOB_POLL_INTERVAL_SECS", var("JOB_POLL_INTERVAL_SECS"), 5)?,
            )?),
            job_stale_after: (stale_secs > 0).then(|| Duration::from_secs(stale_secs)),
            dev_mode,
        })
    }
}

fn parse_u64(name: &'static str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(v) => v.parse().map_err(|_| ConfigError::Invalid {
            name,
            reason: format!("expected a non-negative integer, got '{v}'"),
        }),
        None => Ok(default),
    }
}

fn positive(name: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::Invalid {
            name,
            reason: format!("expected a boolean, got '{other}'"),
        }),
    }
}
