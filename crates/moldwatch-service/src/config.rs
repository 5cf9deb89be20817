//! Service configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use moldwatch_core::{
    ChannelOptions, HubConfig, QueryOptions, ReconnectOptions, RetentionPolicy, RetryConfig,
    SubscribeOptions,
};
use moldwatch_types::{DeviceId, RelativeRange};

/// Service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server settings.
    pub server: ServerConfig,
    /// Live telemetry channel settings.
    pub channel: ChannelConfig,
    /// History endpoint settings.
    pub query: QueryConfig,
    /// In-memory retention settings.
    pub store: StoreConfig,
    /// Devices subscribed at startup.
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return every problem found.
    ///
    /// # Example
    ///
    /// ```
    /// use moldwatch_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.channel.validate());
        errors.extend(self.query.validate());
        errors.extend(self.store.validate());

        let mut seen = std::collections::HashSet::new();
        for (i, device) in self.devices.iter().enumerate() {
            let prefix = format!("devices[{}]", i);
            errors.extend(device.validate(&prefix));

            if !seen.insert(device.id.trim().to_string()) {
                errors.push(ValidationError {
                    field: format!("{}.id", prefix),
                    message: format!("duplicate device id '{}'", device.id),
                });
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Options for the telemetry hub.
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            channel: self.channel.options(),
            query: self.query.options(),
            retention: self.store.policy(),
            event_capacity: self.server.broadcast_buffer,
        }
    }
}

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address (e.g., "127.0.0.1:8080").
    pub bind: String,
    /// Capacity of the event broadcast feeding WebSocket clients.
    pub broadcast_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            broadcast_buffer: 1024,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.bind.is_empty() {
            errors.push(ValidationError::new("server.bind", "bind address cannot be empty"));
        } else {
            match self.bind.rsplit_once(':') {
                None => errors.push(ValidationError::new(
                    "server.bind",
                    format!("invalid bind address '{}': expected format 'host:port'", self.bind),
                )),
                Some((_, port)) => match port.parse::<u16>() {
                    Ok(0) => errors.push(ValidationError::new("server.bind", "port cannot be 0")),
                    Err(_) => errors.push(ValidationError::new(
                        "server.bind",
                        format!("invalid port '{}': must be a number 1-65535", port),
                    )),
                    Ok(_) => {}
                },
            }
        }

        if self.broadcast_buffer == 0 {
            errors.push(ValidationError::new(
                "server.broadcast_buffer",
                "broadcast buffer must be at least 1",
            ));
        }

        errors
    }
}

/// Live channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// WebSocket URL of the telemetry server.
    pub url: String,
    /// Token sent in the authentication handshake.
    pub token: Option<String>,
    /// First reconnect delay in milliseconds.
    pub reconnect_initial_ms: u64,
    /// Reconnect delay cap in milliseconds.
    pub reconnect_max_ms: u64,
    /// Give up after this many consecutive failures (omit for unlimited).
    pub max_attempts: Option<u32>,
    /// Timeout for a single connection attempt in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000/telemetry".to_string(),
            token: None,
            reconnect_initial_ms: 1_000,
            reconnect_max_ms: 30_000,
            max_attempts: None,
            connect_timeout_secs: 10,
        }
    }
}

impl ChannelConfig {
    /// Validate channel configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            errors.push(ValidationError::new(
                "channel.url",
                format!("invalid URL '{}': must start with ws:// or wss://", self.url),
            ));
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            errors.push(ValidationError::new(
                "channel.token",
                "token cannot be empty string (omit it instead)",
            ));
        }
        if self.reconnect_initial_ms == 0 {
            errors.push(ValidationError::new(
                "channel.reconnect_initial_ms",
                "reconnect delay must be at least 1ms",
            ));
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            errors.push(ValidationError::new(
                "channel.reconnect_max_ms",
                format!(
                    "maximum delay {}ms is below the initial delay {}ms",
                    self.reconnect_max_ms, self.reconnect_initial_ms
                ),
            ));
        }
        if self.max_attempts == Some(0) {
            errors.push(ValidationError::new(
                "channel.max_attempts",
                "max attempts must be at least 1 (omit for unlimited)",
            ));
        }
        if self.connect_timeout_secs == 0 {
            errors.push(ValidationError::new(
                "channel.connect_timeout_secs",
                "connect timeout must be at least 1 second",
            ));
        }

        errors
    }

    /// Channel options for the hub.
    pub fn options(&self) -> ChannelOptions {
        let mut reconnect = ReconnectOptions::new()
            .initial_delay(Duration::from_millis(self.reconnect_initial_ms))
            .max_delay(Duration::from_millis(self.reconnect_max_ms))
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs));
        if let Some(attempts) = self.max_attempts {
            reconnect = reconnect.max_attempts(attempts);
        }

        let options = ChannelOptions::new().reconnect(reconnect);
        match &self.token {
            Some(token) => options.auth_token(token.clone()),
            None => options,
        }
    }
}

/// History endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Base URL of the history endpoint (`POST {base_url}/history`).
    pub base_url: String,
    /// Bearer token for the history endpoint.
    pub token: Option<String>,
    /// Maximum rows per query.
    pub limit: usize,
    /// Total attempts per query, including the first.
    pub attempts: u32,
    /// Timeout for a single attempt in seconds.
    pub timeout_secs: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000/api".to_string(),
            token: None,
            limit: 5_000,
            attempts: 3,
            timeout_secs: 30,
        }
    }
}

impl QueryConfig {
    /// Validate query configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            errors.push(ValidationError::new(
                "query.base_url",
                format!(
                    "invalid URL '{}': must start with http:// or https://",
                    self.base_url
                ),
            ));
        }
        if self.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            errors.push(ValidationError::new(
                "query.token",
                "token cannot be empty string (omit it instead)",
            ));
        }
        if self.limit == 0 {
            errors.push(ValidationError::new("query.limit", "limit must be at least 1"));
        }
        if !(1..=10).contains(&self.attempts) {
            errors.push(ValidationError::new(
                "query.attempts",
                format!("attempts {} out of range (1-10)", self.attempts),
            ));
        }
        if self.timeout_secs == 0 {
            errors.push(ValidationError::new(
                "query.timeout_secs",
                "timeout must be at least 1 second",
            ));
        }

        errors
    }

    /// Query options for the hub.
    pub fn options(&self) -> QueryOptions {
        QueryOptions::new()
            .limit(self.limit)
            .retry(RetryConfig::for_query().max_retries(self.attempts.saturating_sub(1)))
            .timeout(Duration::from_secs(self.timeout_secs))
    }
}

/// In-memory retention configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Samples kept per device.
    pub max_samples: usize,
    /// Hours of data kept behind the newest sample (omit to keep by count only).
    pub max_age_hours: Option<u64>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_samples: 10_000,
            max_age_hours: Some(24),
        }
    }
}

impl StoreConfig {
    /// Longest accepted age window (10 years).
    pub const MAX_AGE_HOURS: u64 = 87_600;

    /// Validate store configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.max_samples == 0 {
            errors.push(ValidationError::new(
                "store.max_samples",
                "max samples must be at least 1",
            ));
        }
        match self.max_age_hours {
            Some(0) => errors.push(ValidationError::new(
                "store.max_age_hours",
                "max age must be at least 1 hour (omit to disable)",
            )),
            Some(hours) if hours > Self::MAX_AGE_HOURS => errors.push(ValidationError::new(
                "store.max_age_hours",
                format!(
                    "max age {} exceeds {} hours (omit to disable)",
                    hours,
                    Self::MAX_AGE_HOURS
                ),
            )),
            _ => {}
        }

        errors
    }

    /// Retention policy for the hub.
    ///
    /// Ages beyond [`Self::MAX_AGE_HOURS`] are clamped to it.
    pub fn policy(&self) -> RetentionPolicy {
        let max_age = self.max_age_hours.map(|hours| {
            let hours = i64::try_from(hours.min(Self::MAX_AGE_HOURS)).unwrap_or(i64::MAX);
            time::Duration::hours(hours)
        });
        RetentionPolicy::new()
            .max_samples(self.max_samples)
            .max_age(max_age)
    }
}

/// A device subscribed at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device identifier as known to the telemetry server.
    pub id: String,
    /// Friendly alias for the device.
    #[serde(default)]
    pub alias: Option<String>,
    /// Backfill window (e.g., "-1h", "-30m").
    #[serde(default)]
    pub historical_range: RelativeRange,
    /// Include realtime samples.
    #[serde(default = "default_true")]
    pub realtime: bool,
    /// Include SPC samples.
    #[serde(default = "default_true")]
    pub spc: bool,
}

fn default_true() -> bool {
    true
}

impl DeviceConfig {
    /// A device with default subscription options.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alias: None,
            historical_range: RelativeRange::default(),
            realtime: true,
            spc: true,
        }
    }

    /// Validate device configuration.
    pub fn validate(&self, prefix: &str) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = DeviceId::parse(&self.id) {
            errors.push(ValidationError::new(format!("{}.id", prefix), e.to_string()));
        }

        if let Some(alias) = &self.alias
            && alias.is_empty()
        {
            errors.push(ValidationError::new(
                format!("{}.alias", prefix),
                "alias cannot be empty string (use null/omit instead)",
            ));
        }

        errors
    }

    /// The parsed device identifier.
    pub fn device_id(&self) -> Result<DeviceId, moldwatch_types::ParseError> {
        DeviceId::parse(&self.id)
    }

    /// Subscription options for this device.
    pub fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::new()
            .historical_range(self.historical_range)
            .enable_realtime(self.realtime)
            .enable_spc(self.spc)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `server.bind` or `devices[0].id`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("moldwatch")
        .join("service.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.store.max_samples, 10_000);
        assert_eq!(config.query.attempts, 3);
        assert!(config.devices.is_empty());
    }

    #[test]
    fn test_default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_device_config_defaults() {
        let config: DeviceConfig = toml::from_str(r#"id = "press-07""#).unwrap();
        assert_eq!(config.historical_range.to_string(), "-1h");
        assert!(config.realtime);
        assert!(config.spc);
        assert_eq!(config.alias, None);
    }

    #[test]
    fn test_config_full_toml() {
        let toml = r#"
            [server]
            bind = "0.0.0.0:9090"

            [channel]
            url = "wss://telemetry.plant.example/ws"
            token = "secret"
            max_attempts = 5

            [query]
            base_url = "https://telemetry.plant.example/api"
            limit = 2000
            attempts = 4

            [store]
            max_samples = 500

            [[devices]]
            id = "press-07"
            alias = "Line 3 press"
            historical_range = "-30m"

            [[devices]]
            id = "press-08"
            spc = false
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.bind, "0.0.0.0:9090");
        assert_eq!(config.server.broadcast_buffer, 1024);
        assert_eq!(config.channel.token.as_deref(), Some("secret"));
        assert_eq!(config.store.max_age_hours, Some(24));
        assert_eq!(config.devices.len(), 2);
        assert!(!config.devices[1].spc);

        let hub = config.hub_config();
        assert_eq!(hub.query.limit, 2000);
        assert_eq!(hub.query.retry.max_attempts(), 4);
        assert_eq!(hub.channel.reconnect.max_attempts, Some(5));
        assert_eq!(hub.retention.max_samples, 500);

        let options = config.devices[0].subscribe_options();
        assert_eq!(options.historical_range.span(), time::Duration::minutes(30));
    }

    #[test]
    fn test_config_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("nested").join("service.toml");

        let mut config = Config::default();
        config.devices.push(DeviceConfig {
            id: "press-07".to_string(),
            alias: Some("Press".to_string()),
            historical_range: "-6h".parse().unwrap(),
            realtime: true,
            spc: false,
        });

        config.save(&config_path).unwrap();
        let loaded = Config::load_validated(&config_path).unwrap();
        assert_eq!(loaded.devices[0].id, "press-07");
        assert_eq!(loaded.devices[0].historical_range.to_string(), "-6h");
        assert!(!loaded.devices[0].spc);
    }

    #[test]
    fn test_config_load_nonexistent() {
        let result = Config::load("/nonexistent/path/service.toml");
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_config_load_invalid_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("bad.toml");
        std::fs::write(&path, "[server\nbind = ").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_invalid_relative_range_is_a_parse_error() {
        let toml = r#"
            [[devices]]
            id = "press-07"
            historical_range = "yesterday"
        "#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_validation_collects_every_error() {
        let mut config = Config::default();
        config.server.bind = "localhost".to_string();
        config.channel.url = "http://wrong-scheme".to_string();
        config.query.limit = 0;
        config.store.max_age_hours = Some(0);
        config.devices = vec![
            DeviceConfig {
                id: "  ".to_string(),
                alias: Some(String::new()),
                historical_range: RelativeRange::default(),
                realtime: true,
                spc: true,
            },
            DeviceConfig::new("press-07"),
            DeviceConfig::new(" press-07 "),
        ];

        let Err(ConfigError::Validation(errors)) = config.validate() else {
            panic!("expected validation errors");
        };
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "server.bind",
                "channel.url",
                "query.limit",
                "store.max_age_hours",
                "devices[0].id",
                "devices[0].alias",
                "devices[2].id",
            ]
        );
    }

    #[test]
    fn test_store_age_is_bounded() {
        let mut store = StoreConfig::default();
        store.max_age_hours = Some(StoreConfig::MAX_AGE_HOURS);
        assert!(store.validate().is_empty());
        assert_eq!(
            store.policy().max_age,
            Some(time::Duration::hours(87_600))
        );

        for hours in [StoreConfig::MAX_AGE_HOURS + 1, i64::MAX as u64 + 1, u64::MAX] {
            store.max_age_hours = Some(hours);
            let errors = store.validate();
            assert_eq!(errors.len(), 1, "{hours}");
            assert_eq!(errors[0].field, "store.max_age_hours");
            // Never negative, even when validation is skipped
            assert_eq!(store.policy().max_age, Some(time::Duration::hours(87_600)));
        }

        let toml = r#"
            [store]
            max_age_hours = 9223372036854775807
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Validation(_))));

        store.max_age_hours = None;
        assert!(store.policy().max_age.is_none());
    }

    #[test]
    fn test_bind_port_validation() {
        let mut server = ServerConfig::default();
        server.bind = "127.0.0.1:0".to_string();
        assert_eq!(server.validate()[0].message, "port cannot be 0");
        server.bind = "127.0.0.1:http".to_string();
        assert!(server.validate()[0].message.contains("invalid port"));
        server.bind = "[::1]:8080".to_string();
        assert!(server.validate().is_empty());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation(vec![ValidationError::new("query.limit", "limit must be at least 1")]);
        assert_eq!(
            err.to_string(),
            "Configuration validation failed:\n  - query.limit: limit must be at least 1"
        );
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.ends_with("moldwatch/service.toml"));
    }
}
