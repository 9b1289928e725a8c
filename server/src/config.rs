//! Relay configuration loaded from a JSON object file.
//!
//! Every key is optional. A value that is present but unusable falls back to
//! its default and produces a warning; warnings are returned to the caller
//! because logging is configured from the result.

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde_json::{Map, Value};

use crate::ban_ledger::AutoBanPolicy;
use crate::error::ServerError;

pub const DEFAULT_CONFIG_PATH: &str = "console-relay.json";

/// Longest accepted interval or ban setting: ten years. Timer deadlines
/// computed from larger values overflow.
pub const MAX_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub client_listen_address: String,
    pub client_listen_port: u16,
    pub message_listen_address: String,
    pub message_listen_port: u16,
    pub control_listen_address: String,
    pub control_listen_port: u16,
    pub max_clients: usize,
    /// Empty means subscribers need no password.
    pub password: String,
    pub auto_ban: AutoBanPolicy,
    pub client_check_interval: Duration,
    pub log_stats_enabled: bool,
    pub log_stats_interval: Duration,
    pub log_file: Option<PathBuf>,
    pub debug_level: u8,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            client_listen_address: "0.0.0.0".to_string(),
            client_listen_port: 23456,
            message_listen_address: "0.0.0.0".to_string(),
            message_listen_port: 12345,
            control_listen_address: "127.0.0.1".to_string(),
            control_listen_port: 34568,
            max_clients: 10,
            password: String::new(),
            auto_ban: AutoBanPolicy::default(),
            client_check_interval: Duration::from_secs(10),
            log_stats_enabled: true,
            log_stats_interval: Duration::from_secs(86_400),
            log_file: None,
            debug_level: 0,
        }
    }
}

impl RelayConfig {
    /// Reads and parses the configuration file at `path`.
    pub fn load(path: &Path) -> Result<(Self, Vec<String>), ServerError> {
        let text = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<(Self, Vec<String>), ServerError> {
        let value: Value = serde_json::from_str(text)?;
        let object = value.as_object().ok_or(ServerError::ConfigShape)?;
        Ok(Self::from_object(object))
    }

    fn from_object(object: &Map<String, Value>) -> (Self, Vec<String>) {
        let defaults = Self::default();
        let mut options = OptionReader {
            object,
            warnings: Vec::new(),
        };

        let config = Self {
            client_listen_address: options
                .string("client_listen_address", defaults.client_listen_address),
            client_listen_port: options.integer("client_listen_port", defaults.client_listen_port, 0),
            message_listen_address: options
                .string("message_listen_address", defaults.message_listen_address),
            message_listen_port: options.integer(
                "message_listen_port",
                defaults.message_listen_port,
                0,
            ),
            control_listen_address: options
                .string("control_listen_address", defaults.control_listen_address),
            control_listen_port: options.integer(
                "control_listen_port",
                defaults.control_listen_port,
                0,
            ),
            max_clients: options.integer("max_clients", defaults.max_clients, 0),
            password: options.string("password", defaults.password),
            auto_ban: AutoBanPolicy {
                enabled: options.flag("auto_ban_enabled", defaults.auto_ban.enabled),
                threshold: options.integer("auto_ban_threshold", defaults.auto_ban.threshold, 1),
                time_limit: options.seconds("auto_ban_time_limit", defaults.auto_ban.time_limit, 0),
                duration: options.seconds("auto_ban_duration", defaults.auto_ban.duration, 0),
            },
            client_check_interval: options.seconds(
                "client_check_interval",
                defaults.client_check_interval,
                1,
            ),
            log_stats_enabled: options.flag("log_stats_enabled", defaults.log_stats_enabled),
            log_stats_interval: options.seconds(
                "log_stats_interval",
                defaults.log_stats_interval,
                1,
            ),
            log_file: options.path("log_file"),
            debug_level: options.integer("debug_level", defaults.debug_level, 0),
        };

        let mut warnings = options.warnings;
        for (listener, address) in [
            ("client", &config.client_listen_address),
            ("message", &config.message_listen_address),
        ] {
            if is_loopback(address) {
                warnings.push(format!(
                    "The {listener} listen address {address} is a loopback address; \
                     it is meant for testing only"
                ));
            }
        }

        (config, warnings)
    }

    pub fn client_listen_addr(&self) -> String {
        join_host_port(&self.client_listen_address, self.client_listen_port)
    }

    pub fn message_listen_addr(&self) -> String {
        join_host_port(&self.message_listen_address, self.message_listen_port)
    }

    pub fn control_listen_addr(&self) -> String {
        join_host_port(&self.control_listen_address, self.control_listen_port)
    }

    pub fn password_required(&self) -> bool {
        !self.password.is_empty()
    }

    /// Logs the effective configuration. The password itself is never logged.
    pub fn log_effective(&self) {
        info!("Client listener: {}", self.client_listen_addr());
        info!("Message listener: {}", self.message_listen_addr());
        info!("Control listener: {}", self.control_listen_addr());
        info!("Maximum clients: {}", self.max_clients);
        info!(
            "Password: {}",
            if self.password_required() {
                "required"
            } else {
                "not required"
            }
        );
        info!("Client check interval: {}s", self.client_check_interval.as_secs());
        if self.auto_ban.enabled {
            info!(
                "Auto-ban: threshold {}, window {}, duration {}",
                self.auto_ban.threshold,
                Seconds(self.auto_ban.time_limit, "unlimited"),
                Seconds(self.auto_ban.duration, "permanent")
            );
        } else {
            info!("Auto-ban: disabled");
        }
        if self.log_stats_enabled {
            info!("Statistics every {}s", self.log_stats_interval.as_secs());
        }
    }
}

/// Renders a duration in seconds, or `zero` when it is zero.
struct Seconds(Duration, &'static str);

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_zero() {
            f.write_str(self.1)
        } else {
            write!(f, "{}s", self.0.as_secs())
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn is_loopback(address: &str) -> bool {
    address.eq_ignore_ascii_case("localhost")
        || address
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Typed lookups over the raw JSON object, collecting warnings as it goes.
struct OptionReader<'a> {
    object: &'a Map<String, Value>,
    warnings: Vec<String>,
}

impl OptionReader<'_> {
    fn reject<T: fmt::Debug>(&mut self, key: &str, value: &Value, default: T) -> T {
        self.warnings.push(format!(
            "Invalid value {value} for option {key}; using default {default:?}"
        ));
        default
    }

    /// Accepts JSON integers and strings holding an integer.
    fn integer<T>(&mut self, key: &str, default: T, min: u64) -> T
    where
        T: TryFrom<u64> + fmt::Debug,
    {
        self.integer_in(key, default, min, u64::MAX)
    }

    fn integer_in<T>(&mut self, key: &str, default: T, min: u64, max: u64) -> T
    where
        T: TryFrom<u64> + fmt::Debug,
    {
        let Some(value) = self.object.get(key) else {
            return default;
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        match parsed.filter(|n| (min..=max).contains(n)).and_then(|n| T::try_from(n).ok()) {
            Some(v) => v,
            None => self.reject(key, value, default),
        }
    }

    fn seconds(&mut self, key: &str, default: Duration, min: u64) -> Duration {
        Duration::from_secs(self.integer_in(key, default.as_secs(), min, MAX_SECONDS))
    }

    /// Accepts booleans as well as 0/1, numeric or quoted.
    fn flag(&mut self, key: &str, default: bool) -> bool {
        let Some(value) = self.object.get(key) else {
            return default;
        };
        let parsed = match value {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => match n.as_u64() {
                Some(0) => Some(false),
                Some(1) => Some(true),
                _ => None,
            },
            Value::String(s) => match s.trim() {
                "0" | "false" => Some(false),
                "1" | "true" => Some(true),
                _ => None,
            },
            _ => None,
        };
        match parsed {
            Some(v) => v,
            None => self.reject(key, value, default),
        }
    }

    fn string(&mut self, key: &str, default: String) -> String {
        match self.object.get(key) {
            None => default,
            Some(Value::String(s)) => s.trim().to_string(),
            Some(other) => self.reject(key, other, default),
        }
    }

    fn path(&mut self, key: &str) -> Option<PathBuf> {
        let text = self.string(key, String::new());
        (!text.is_empty()).then(|| PathBuf::from(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_gives_defaults() {
        let (config, warnings) = RelayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert!(warnings.is_empty());
        assert_eq!(config.client_listen_addr(), "0.0.0.0:23456");
        assert_eq!(config.message_listen_addr(), "0.0.0.0:12345");
        assert_eq!(config.control_listen_addr(), "127.0.0.1:34568");
        assert!(!config.password_required());
    }

    #[test]
    fn test_overrides_are_applied() {
        let (config, warnings) = RelayConfig::from_json_str(
            r#"{
                "client_listen_address": " 192.168.1.10 ",
                "client_listen_port": 4000,
                "max_clients": "3",
                "password": "secret",
                "auto_ban_enabled": 0,
                "auto_ban_threshold": 2,
                "auto_ban_time_limit": 30,
                "client_check_interval": 5,
                "log_stats_enabled": false,
                "log_file": "relay.log",
                "debug_level": 2
            }"#,
        )
        .unwrap();

        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(config.client_listen_addr(), "192.168.1.10:4000");
        assert_eq!(config.max_clients, 3);
        assert!(config.password_required());
        assert!(!config.auto_ban.enabled);
        assert_eq!(config.auto_ban.threshold, 2);
        assert_eq!(config.auto_ban.time_limit, Duration::from_secs(30));
        assert_eq!(config.client_check_interval, Duration::from_secs(5));
        assert!(!config.log_stats_enabled);
        assert_eq!(config.log_file, Some(PathBuf::from("relay.log")));
        assert_eq!(config.debug_level, 2);
    }

    #[test]
    fn test_invalid_values_fall_back_with_warnings() {
        let (config, warnings) = RelayConfig::from_json_str(
            r#"{
                "client_listen_port": 70000,
                "max_clients": -1,
                "auto_ban_threshold": 0,
                "client_check_interval": "soon",
                "log_stats_enabled": "maybe",
                "password": 12
            }"#,
        )
        .unwrap();

        let defaults = RelayConfig::default();
        assert_eq!(config.client_listen_port, defaults.client_listen_port);
        assert_eq!(config.max_clients, defaults.max_clients);
        assert_eq!(config.auto_ban.threshold, defaults.auto_ban.threshold);
        assert_eq!(config.client_check_interval, defaults.client_check_interval);
        assert_eq!(config.log_stats_enabled, defaults.log_stats_enabled);
        assert_eq!(config.password, defaults.password);
        assert_eq!(warnings.len(), 6);
        assert!(warnings.iter().any(|w| w.contains("client_listen_port")));
    }

    #[test]
    fn test_huge_intervals_fall_back_with_warnings() {
        let (config, warnings) = RelayConfig::from_json_str(
            r#"{
                "client_check_interval": 18446744073709551615,
                "log_stats_interval": "315360001",
                "auto_ban_duration": 315360000
            }"#,
        )
        .unwrap();

        let defaults = RelayConfig::default();
        assert_eq!(config.client_check_interval, defaults.client_check_interval);
        assert_eq!(config.log_stats_interval, defaults.log_stats_interval);
        assert_eq!(config.auto_ban.duration, Duration::from_secs(MAX_SECONDS));
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("log_stats_interval")));
    }

    #[test]
    fn test_loopback_listener_warns() {
        let (_, warnings) = RelayConfig::from_json_str(
            r#"{ "message_listen_address": "127.0.0.1", "client_listen_address": "localhost" }"#,
        )
        .unwrap();

        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.contains("loopback")));
    }

    #[test]
    fn test_ipv6_hosts_are_bracketed() {
        let config = RelayConfig {
            control_listen_address: "::1".to_string(),
            ..RelayConfig::default()
        };
        assert_eq!(config.control_listen_addr(), "[::1]:34568");
    }

    #[test]
    fn test_rejects_non_object_documents() {
        assert!(matches!(
            RelayConfig::from_json_str("[1, 2]"),
            Err(ServerError::ConfigShape)
        ));
        assert!(matches!(
            RelayConfig::from_json_str("{ not json"),
            Err(ServerError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let err = RelayConfig::load(Path::new("/nonexistent/console-relay.json")).unwrap_err();
        assert!(matches!(err, ServerError::ConfigRead { .. }));
    }
}
