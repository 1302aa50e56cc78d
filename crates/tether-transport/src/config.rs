//! Relay link configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Tuning for the relay link and its reconnect state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay server URL.
    pub relay_url: String,
    /// Budget for one handshake attempt.
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles per consecutive failure.
    pub reconnect_base_delay: Duration,
    /// Ceiling for the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Failed retries tolerated per outage before the link goes Failed.
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay_url: "wss://relay.tether.example:443".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `TETHER_RELAY_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("TETHER_RELAY_URL") {
            config.relay_url = url;
        }
        if let Ok(secs) = std::env::var("TETHER_RELAY_CONNECT_TIMEOUT_SECS") {
            config.connect_timeout = Duration::from_secs(parse_var("connect_timeout", &secs)?);
        }
        if let Ok(millis) = std::env::var("TETHER_RELAY_BASE_DELAY_MS") {
            config.reconnect_base_delay =
                Duration::from_millis(parse_var("reconnect_base_delay", &millis)?);
        }
        if let Ok(secs) = std::env::var("TETHER_RELAY_MAX_DELAY_SECS") {
            config.reconnect_max_delay =
                Duration::from_secs(parse_var("reconnect_max_delay", &secs)?);
        }
        if let Ok(attempts) = std::env::var("TETHER_RELAY_MAX_RECONNECTS") {
            config.max_reconnect_attempts =
                parse_var::<u32>("max_reconnect_attempts", &attempts)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relay_url.is_empty() {
            return Err(ConfigError::Invalid("relay_url must not be empty".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid("connect_timeout must be > 0".into()));
        }
        if self.reconnect_base_delay > self.reconnect_max_delay {
            return Err(ConfigError::Invalid(
                "reconnect_base_delay must not exceed reconnect_max_delay".into(),
            ));
        }
        Ok(())
    }

    /// Reconnect delay for the given consecutive-failure step: exponential
    /// growth from the base delay, capped at the max delay.
    pub fn backoff_delay(&self, step: u32) -> Duration {
        let exp = self.reconnect_base_delay.as_secs_f64() * 2.0_f64.powi(step.min(16) as i32);
        Duration::from_secs_f64(exp.min(self.reconnect_max_delay.as_secs_f64()))
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.relay_url = url.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.reconnect_base_delay = base;
        self.reconnect_max_delay = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("invalid {}: {}", name, value)))
}
