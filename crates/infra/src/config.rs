//! Configuration loading and representation.
//!
//! All settings come from environment variables. [`AppConfig::from_lookup`]
//! takes any key lookup so parsing can be tested without touching the
//! process environment.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use hookrelay_core::DEFAULT_MAX_ATTEMPTS;

use crate::retry::RetryConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value:?} ({reason})")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    /// `None` selects the in-memory store (development only).
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub bind_addr: SocketAddr,
    pub max_attempts: u32,
    pub retry: RetryConfig,
    pub poll_interval: Duration,
    pub idle_interval: Duration,
    pub error_backoff: Duration,
    pub worker_count: usize,
    /// Run workers inside the API process. Always on for the in-memory store.
    pub embedded_worker: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        Self {
            database_url: None,
            database_max_connections: 10,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryConfig::default(),
            poll_interval: worker.poll_interval,
            idle_interval: worker.idle_interval,
            error_backoff: worker.error_backoff,
            worker_count: 1,
            embedded_worker: true,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL");
        let embedded_worker = match parse_bool(&get, "EMBEDDED_WORKER")? {
            _ if database_url.is_none() => true,
            Some(flag) => flag,
            None => false,
        };

        let config = Self {
            database_max_connections: parse(&get, "DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.database_max_connections),
            bind_addr: parse(&get, "BIND_ADDR")?.unwrap_or(defaults.bind_addr),
            max_attempts: parse(&get, "EVENT_MAX_ATTEMPTS")?.unwrap_or(defaults.max_attempts),
            retry: RetryConfig {
                base_delay_secs: parse(&get, "RETRY_BASE_DELAY_SECS")?
                    .unwrap_or(defaults.retry.base_delay_secs),
                multiplier: parse(&get, "RETRY_MULTIPLIER")?.unwrap_or(defaults.retry.multiplier),
                jitter_factor: parse(&get, "RETRY_JITTER_FACTOR")?
                    .unwrap_or(defaults.retry.jitter_factor),
            },
            poll_interval: parse_millis(&get, "WORKER_POLL_INTERVAL_MS")?
                .unwrap_or(defaults.poll_interval),
            idle_interval: parse_millis(&get, "WORKER_IDLE_INTERVAL_MS")?
                .unwrap_or(defaults.idle_interval),
            error_backoff: parse_millis(&get, "WORKER_ERROR_BACKOFF_MS")?
                .unwrap_or(defaults.error_backoff),
            worker_count: parse(&get, "WORKER_COUNT")?.unwrap_or(defaults.worker_count),
            database_url,
            embedded_worker,
        };
        config.validate()?;
        Ok(config)
    }

    /// Worker settings for the `index`-th loop of this process.
    pub fn worker_config(&self, index: usize) -> WorkerConfig {
        WorkerConfig {
            name: format!("worker-{index}"),
            poll_interval: self.poll_interval,
            idle_interval: self.idle_interval,
            error_backoff: self.error_backoff,
            max_attempts: self.max_attempts,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |var: &'static str, value: String, reason: &str| ConfigError::Invalid {
            var,
            value,
            reason: reason.to_string(),
        };
        if self.max_attempts == 0 {
            return Err(invalid("EVENT_MAX_ATTEMPTS", "0".into(), "must be at least 1"));
        }
        if self.database_max_connections == 0 {
            return Err(invalid("DATABASE_MAX_CONNECTIONS", "0".into(), "must be at least 1"));
        }
        if self.worker_count == 0 {
            return Err(invalid("WORKER_COUNT", "0".into(), "must be at least 1"));
        }
        if !(self.retry.multiplier.is_finite() && self.retry.multiplier >= 1.0) {
            return Err(invalid(
                "RETRY_MULTIPLIER",
                self.retry.multiplier.to_string(),
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return Err(invalid(
                "RETRY_JITTER_FACTOR",
                self.retry.jitter_factor.to_string(),
                "must be in [0.0, 1.0)",
            ));
        }
        Ok(())
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&'static str) -> Option<String>,
{
    get(var)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn parse_millis<G>(get: &G, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    Ok(parse::<u64, G>(get, var)?.map(Duration::from_millis))
}

fn parse_bool<G>(get: &G, var: &'static str) -> Result<Option<bool>, ConfigError>
where
    G: Fn(&'static str) -> Option<String>,
{
    get(var)
        .map(|raw| match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var,
                value: raw.clone(),
                reason: "expected a boolean".to_string(),
            }),
        })
        .transpose()
}
