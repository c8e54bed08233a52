// src/config.rs

//! Service configuration: loading, defaults, and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

/// Tunables of the subscription service.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Maximum concurrent channel subscriptions multiplexed onto a single
    /// pub/sub connection.
    #[serde(default = "default_subscriptions_per_connection")]
    pub subscriptions_per_connection: u32,
    /// Maximum connect retries for a caller-initiated subscribe. Reattach
    /// recovery ignores this and retries without bound.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between connect retries, in milliseconds. Also bounds how long
    /// a single connection attempt may stay pending before it is abandoned
    /// and re-entered.
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
    /// Acknowledgement watchdog for subscribe and unsubscribe exchanges, in
    /// milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_subscriptions_per_connection() -> u32 {
    5
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    1500
}
fn default_timeout_ms() -> u64 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            subscriptions_per_connection: default_subscriptions_per_connection(),
            retry_attempts: default_retry_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Config {
    /// Loads and validates a configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file at '{path}'"))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects configurations the engines cannot operate under.
    pub fn validate(&self) -> Result<()> {
        if self.subscriptions_per_connection == 0 {
            return Err(anyhow!("subscriptions_per_connection must be at least 1"));
        }
        if self.timeout_ms == 0 {
            return Err(anyhow!("timeout_ms must be greater than zero"));
        }
        Ok(())
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
