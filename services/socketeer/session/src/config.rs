//! Server options and their validated, resolved form.
//!
//! [`ServerOptions`] is what callers hand in: every timing option may be a
//! JSON number or a numeric string of milliseconds, and any option may be
//! left out. [`ServerConfig::from_options`] resolves it into immutable
//! durations, falling back to the defaults for missing, zero or empty values.

use serde::{Deserialize, Serialize};
use socketeer_store::StoreConfig;
use std::time::Duration;
use thiserror::Error;

/// Default pong deadline (ms)
pub const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 15_000;
/// Default ping period (ms)
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;
/// Default handshake deadline (ms)
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
/// Default idle session expiry (ms)
pub const DEFAULT_MAX_SESSION_AGE_MS: u64 = 10_000;

/// Configuration errors, raised at construction only
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Option value is not a number
    #[error("Invalid parameter for {option}: Must be a number")]
    InvalidNumber {
        /// Offending option
        option: &'static str,
    },
    /// Option value is a negative number
    #[error("Invalid parameter for {option}: Must be a non-negative number")]
    Negative {
        /// Offending option
        option: &'static str,
    },
}

/// Raw value of a timing option, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    /// Numeric value
    Millis(f64),
    /// Textual value, parsed as a number on resolution
    Text(String),
}

impl From<u64> for OptionValue {
    fn from(value: u64) -> Self {
        OptionValue::Millis(value as f64)
    }
}

impl From<f64> for OptionValue {
    fn from(value: f64) -> Self {
        OptionValue::Millis(value)
    }
}

impl From<&str> for OptionValue {
    fn from(value: &str) -> Self {
        OptionValue::Text(value.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(value: String) -> Self {
        OptionValue::Text(value)
    }
}

impl From<Duration> for OptionValue {
    fn from(value: Duration) -> Self {
        OptionValue::Millis(value.as_secs_f64() * 1000.0)
    }
}

/// Unvalidated server options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerOptions {
    /// How long to wait for a pong before giving up on the peer
    pub heartbeat_timeout: Option<OptionValue>,
    /// How long after the last pong to send the next ping
    pub heartbeat_interval: Option<OptionValue>,
    /// How long a new connection has to complete the handshake
    pub handshake_timeout: Option<OptionValue>,
    /// Whether sessions can be created and resumed
    pub supports_resuming: bool,
    /// Whether a session may be resumed from another IP
    #[serde(rename = "resumeAllowsDifferentIPs")]
    pub resume_allows_different_ips: bool,
    /// How long an idle session stays resumable
    pub max_session_age: Option<OptionValue>,
}

impl ServerOptions {
    /// Empty options, every value defaulted
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the heartbeat timeout
    pub fn heartbeat_timeout(mut self, value: impl Into<OptionValue>) -> Self {
        self.heartbeat_timeout = Some(value.into());
        self
    }

    /// Set the heartbeat interval
    pub fn heartbeat_interval(mut self, value: impl Into<OptionValue>) -> Self {
        self.heartbeat_interval = Some(value.into());
        self
    }

    /// Set the handshake timeout
    pub fn handshake_timeout(mut self, value: impl Into<OptionValue>) -> Self {
        self.handshake_timeout = Some(value.into());
        self
    }

    /// Enable or disable session resuming
    pub fn supports_resuming(mut self, enabled: bool) -> Self {
        self.supports_resuming = enabled;
        self
    }

    /// Allow or forbid resuming from a different IP
    pub fn resume_allows_different_ips(mut self, allowed: bool) -> Self {
        self.resume_allows_different_ips = allowed;
        self
    }

    /// Set the maximum idle session age
    pub fn max_session_age(mut self, value: impl Into<OptionValue>) -> Self {
        self.max_session_age = Some(value.into());
        self
    }
}

/// Resolved, immutable server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Pong deadline
    pub heartbeat_timeout: Duration,
    /// Ping period
    pub heartbeat_interval: Duration,
    /// Handshake deadline
    pub handshake_timeout: Duration,
    /// Whether sessions can be created and resumed
    pub supports_resuming: bool,
    /// Whether a session may be resumed from another IP
    pub resume_allows_different_ips: bool,
    /// Idle session expiry
    pub max_session_age: Duration,
    /// Period of the background expired-session sweep
    pub sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_millis(DEFAULT_HEARTBEAT_TIMEOUT_MS),
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            supports_resuming: false,
            resume_allows_different_ips: false,
            max_session_age: Duration::from_millis(DEFAULT_MAX_SESSION_AGE_MS),
            sweep_interval: Duration::from_millis(DEFAULT_MAX_SESSION_AGE_MS),
        }
    }
}

impl ServerConfig {
    /// Validate and resolve options
    pub fn from_options(options: &ServerOptions) -> Result<Self, ConfigError> {
        let heartbeat_timeout = resolve_millis(
            "heartbeatTimeout",
            options.heartbeat_timeout.as_ref(),
            DEFAULT_HEARTBEAT_TIMEOUT_MS,
        )?;
        let heartbeat_interval = resolve_millis(
            "heartbeatInterval",
            options.heartbeat_interval.as_ref(),
            DEFAULT_HEARTBEAT_INTERVAL_MS,
        )?;
        let handshake_timeout = resolve_millis(
            "handshakeTimeout",
            options.handshake_timeout.as_ref(),
            DEFAULT_HANDSHAKE_TIMEOUT_MS,
        )?;
        let max_session_age = resolve_millis(
            "maxSessionAge",
            options.max_session_age.as_ref(),
            DEFAULT_MAX_SESSION_AGE_MS,
        )?;

        Ok(Self {
            heartbeat_timeout,
            heartbeat_interval,
            handshake_timeout,
            supports_resuming: options.supports_resuming,
            resume_allows_different_ips: options.resume_allows_different_ips,
            max_session_age,
            sweep_interval: max_session_age,
        })
    }

    /// Session store settings derived from this configuration
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            supports_resuming: self.supports_resuming,
            resume_allows_different_ips: self.resume_allows_different_ips,
            max_session_age: self.max_session_age,
        }
    }
}

fn resolve_millis(
    option: &'static str,
    value: Option<&OptionValue>,
    default_ms: u64,
) -> Result<Duration, ConfigError> {
    let default = Duration::from_millis(default_ms);
    let millis = match value {
        None => return Ok(default),
        Some(OptionValue::Millis(millis)) => *millis,
        Some(OptionValue::Text(text)) => {
            let text = text.trim();
            if text.is_empty() {
                return Ok(default);
            }
            text.parse::<f64>()
                .map_err(|_| ConfigError::InvalidNumber { option })?
        }
    };

    if !millis.is_finite() {
        return Err(ConfigError::InvalidNumber { option });
    }
    // Zero means "unset"
    if millis == 0.0 {
        return Ok(default);
    }
    if millis < 0.0 {
        return Err(ConfigError::Negative { option });
    }

    Ok(Duration::from_nanos((millis * 1_000_000.0).round() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_options(&ServerOptions::new()).unwrap();
        assert_eq!(config, ServerConfig::default());
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(15_000));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(10_000));
        assert_eq!(config.handshake_timeout, Duration::from_millis(10_000));
        assert_eq!(config.max_session_age, Duration::from_millis(10_000));
        assert!(!config.supports_resuming);
        assert!(!config.resume_allows_different_ips);
    }

    #[test]
    fn test_overrides() {
        let options = ServerOptions::new()
            .heartbeat_timeout(100u64)
            .heartbeat_interval("200")
            .handshake_timeout(300.5)
            .max_session_age(Duration::from_secs(2))
            .supports_resuming(true)
            .resume_allows_different_ips(true);

        let config = ServerConfig::from_options(&options).unwrap();
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(100));
        assert_eq!(config.heartbeat_interval, Duration::from_millis(200));
        assert_eq!(config.handshake_timeout, Duration::from_micros(300_500));
        assert_eq!(config.max_session_age, Duration::from_secs(2));
        assert!(config.supports_resuming);
        assert!(config.resume_allows_different_ips);

        let store = config.store_config();
        assert!(store.supports_resuming);
        assert_eq!(store.max_session_age, Duration::from_secs(2));
    }

    #[test]
    fn test_non_numeric_option_names_the_option() {
        let cases = [
            (ServerOptions::new().heartbeat_timeout("potato"), "heartbeatTimeout"),
            (ServerOptions::new().heartbeat_interval("potato"), "heartbeatInterval"),
            (ServerOptions::new().handshake_timeout("potato"), "handshakeTimeout"),
            (ServerOptions::new().max_session_age("potato"), "maxSessionAge"),
        ];

        for (options, name) in cases {
            let err = ServerConfig::from_options(&options).unwrap_err();
            assert_eq!(err, ConfigError::InvalidNumber { option: name });
            assert_eq!(
                err.to_string(),
                format!("Invalid parameter for {}: Must be a number", name)
            );
        }

        assert!(ServerConfig::from_options(&ServerOptions::new().heartbeat_timeout("NaN")).is_err());
    }

    #[test]
    fn test_negative_option_is_rejected() {
        let err = ServerConfig::from_options(&ServerOptions::new().max_session_age(-5.0)).unwrap_err();
        assert_eq!(err, ConfigError::Negative { option: "maxSessionAge" });
    }

    #[test]
    fn test_zero_and_empty_fall_back_to_defaults() {
        let options = ServerOptions::new().max_session_age(0u64).heartbeat_timeout("");
        let config = ServerConfig::from_options(&options).unwrap();
        assert_eq!(config.max_session_age, Duration::from_millis(10_000));
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn test_deserialize_camel_case() {
        let options: ServerOptions = serde_json::from_str(
            r#"{
                "heartbeatTimeout": 1500,
                "heartbeatInterval": "1000",
                "supportsResuming": true,
                "resumeAllowsDifferentIPs": true
            }"#,
        )
        .unwrap();

        assert_eq!(options.heartbeat_timeout, Some(OptionValue::Millis(1500.0)));
        assert_eq!(
            options.heartbeat_interval,
            Some(OptionValue::Text("1000".to_string()))
        );
        assert!(options.supports_resuming);
        assert!(options.resume_allows_different_ips);
        assert_eq!(options.max_session_age, None);
    }
}
