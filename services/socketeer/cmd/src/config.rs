//! Configuration handling for the socketeer service.
//!
//! Settings come from the shared YAML config file (`services.socketeer.*`
//! keys), then `SOCKETEER_*` environment variables, then command line flags.
//! Timing values are kept as raw option values here; they are validated when
//! the server is constructed, so a bad value fails startup with the option
//! named in the error.

use anyhow::Result;
use serde::Deserialize;
use socketeer_session::{OptionValue, ServerOptions};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use tracing::{info, warn};

/// Socketeer service configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// TCP address to accept connections on
    pub listen_addr: SocketAddr,
    /// Connection lifecycle options
    pub options: ServerOptions,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 7070)),
            options: ServerOptions::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    socketeer: Option<ServiceSection>,
}

#[derive(Debug, Deserialize)]
struct ServiceSection {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl ServiceConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        if let Ok(content) = std::fs::read_to_string(&config_path) {
            match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(root_config) => {
                    config.apply_root_config(root_config);
                    info!("Loaded configuration from {:?}", config_path.as_ref());
                }
                Err(e) => warn!(
                    "Failed to parse config file {:?}, using defaults: {}",
                    config_path.as_ref(),
                    e
                ),
            }
        } else {
            warn!("Config file {:?} not found, using defaults", config_path.as_ref());
        }

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final socketeer configuration: listen={}, supports_resuming={}",
            config.listen_addr, config.options.supports_resuming
        );
        Ok(config)
    }

    fn apply_root_config(&mut self, root_config: RootConfig) {
        if let Some(section) = root_config.services.and_then(|services| services.socketeer) {
            self.apply_service_section(section);
        }
    }

    fn apply_service_section(&mut self, section: ServiceSection) {
        for arg in section.args.unwrap_or_default() {
            if let Some(addr) = arg.strip_prefix("--listen=") {
                self.set("listen_addr", addr.to_string());
            }
        }

        for (key, value) in section.config.unwrap_or_default() {
            match key.strip_prefix("services.socketeer.") {
                Some(name) => self.set(name, value),
                None => {
                    // Ignore keys of other services
                }
            }
        }
    }

    /// Apply `SOCKETEER_*` overrides through a variable lookup
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        const KEYS: [&str; 7] = [
            "listen_addr",
            "heartbeat_interval",
            "heartbeat_timeout",
            "handshake_timeout",
            "max_session_age",
            "supports_resuming",
            "resume_allows_different_ips",
        ];

        for key in KEYS {
            let var = format!("SOCKETEER_{}", key.to_uppercase());
            if let Some(value) = lookup(&var) {
                info!("{} overridden by environment", var);
                self.set(key, value);
            }
        }
    }

    fn set(&mut self, key: &str, value: String) {
        match key {
            "listen_addr" => match value.parse::<SocketAddr>() {
                Ok(addr) => self.listen_addr = addr,
                Err(_) => warn!("Ignoring invalid listen address {:?}", value),
            },
            "heartbeat_interval" => self.options.heartbeat_interval = Some(OptionValue::Text(value)),
            "heartbeat_timeout" => self.options.heartbeat_timeout = Some(OptionValue::Text(value)),
            "handshake_timeout" => self.options.handshake_timeout = Some(OptionValue::Text(value)),
            "max_session_age" => self.options.max_session_age = Some(OptionValue::Text(value)),
            "supports_resuming" => self.options.supports_resuming = parse_flag(&value),
            "resume_allows_different_ips" => {
                self.options.resume_allows_different_ips = parse_flag(&value)
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "true" | "1" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use socketeer_session::ServerConfig;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:7070".parse().unwrap());
        assert_eq!(config.options, ServerOptions::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.listen_addr, ServiceConfig::default().listen_addr);
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  gateway:
    config:
      services.gateway.port: "8080"
  socketeer:
    enabled: true
    executable: ./socketeer
    args:
      - --listen=127.0.0.1:9100
    config:
      services.socketeer.heartbeat_interval: "2500"
      services.socketeer.max_session_age: "60000"
      services.socketeer.supports_resuming: "true"
      services.socketeer.resume_allows_different_ips: "false"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = ServiceConfig::default();
        let root: RootConfig =
            serde_yaml::from_str(&std::fs::read_to_string(temp_file.path()).unwrap()).unwrap();
        config.apply_root_config(root);

        assert_eq!(config.listen_addr, "127.0.0.1:9100".parse().unwrap());
        assert!(config.options.supports_resuming);
        assert!(!config.options.resume_allows_different_ips);

        let resolved = ServerConfig::from_options(&config.options).unwrap();
        assert_eq!(resolved.heartbeat_interval, Duration::from_millis(2500));
        assert_eq!(resolved.max_session_age, Duration::from_secs(60));
        assert_eq!(resolved.heartbeat_timeout, Duration::from_millis(15_000));
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SOCKETEER_LISTEN_ADDR", "127.0.0.1:9200"),
            ("SOCKETEER_HANDSHAKE_TIMEOUT", "potato"),
            ("SOCKETEER_SUPPORTS_RESUMING", "1"),
        ]
        .into_iter()
        .collect();

        let mut config = ServiceConfig::default();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.listen_addr, "127.0.0.1:9200".parse().unwrap());
        assert!(config.options.supports_resuming);

        let err = ServerConfig::from_options(&config.options).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid parameter for handshakeTimeout: Must be a number"
        );
    }

    #[test]
    fn test_invalid_listen_addr_is_ignored() {
        let mut config = ServiceConfig::default();
        config.set("listen_addr", "not-an-address".to_string());
        assert_eq!(config.listen_addr, ServiceConfig::default().listen_addr);
    }
}
