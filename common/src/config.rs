use serde::Deserialize;
use std::{env, fmt, fs, str::FromStr};
use thiserror::Error;
use tracing::debug;

const DEFAULT_DATABASE_URL: &str = "sqlite::memory:";
const DEFAULT_LOG_LEVEL: &str = "info";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("Unknown isolation level: {0}")]
    UnknownIsolationLevel(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Transaction isolation level as written in config files and environment
/// variables (`SERIALIZABLE`, `READ COMMITTED`, `repeatable_read`, ...).
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(try_from = "String")]
pub enum IsolationLevelSetting {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevelSetting {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_uppercase().replace(['_', '-'], " ");
        match normalized.as_str() {
            "READ UNCOMMITTED" => Ok(Self::ReadUncommitted),
            "READ COMMITTED" => Ok(Self::ReadCommitted),
            "REPEATABLE READ" => Ok(Self::RepeatableRead),
            "SERIALIZABLE" => Ok(Self::Serializable),
            _ => Err(ConfigError::UnknownIsolationLevel(value.to_string())),
        }
    }
}

impl TryFrom<String> for IsolationLevelSetting {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for IsolationLevelSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

impl From<IsolationLevelSetting> for sea_orm::IsolationLevel {
    fn from(value: IsolationLevelSetting) -> Self {
        match value {
            IsolationLevelSetting::ReadUncommitted => sea_orm::IsolationLevel::ReadUncommitted,
            IsolationLevelSetting::ReadCommitted => sea_orm::IsolationLevel::ReadCommitted,
            IsolationLevelSetting::RepeatableRead => sea_orm::IsolationLevel::RepeatableRead,
            IsolationLevelSetting::Serializable => sea_orm::IsolationLevel::Serializable,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default)]
    pub max_connections: Option<u32>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default)]
    pub isolation_level: Option<IsolationLevelSetting>,
    #[serde(default = "default_pessimistic_locks")]
    pub pessimistic_locks: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            isolation_level: None,
            pessimistic_locks: default_pessimistic_locks(),
        }
    }
}

fn default_pessimistic_locks() -> bool {
    true
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            sandbox: SandboxConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(config_path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(config_path).map_err(|source| ConfigError::Io {
            path: config_path.to_string(),
            source,
        })?;
        let config: Config = serde_yml::from_str(&contents)?;
        config.log_summary(config_path);

        Ok(config)
    }

    /// Builds the config from `DATABASE_URL`, `DATABASE_MAX_CONNECTIONS`,
    /// `SANDBOX_ISOLATION_LEVEL`, `SANDBOX_PESSIMISTIC_LOCKS` and `LOG_LEVEL`,
    /// after loading a `.env` file if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env file");
        }
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.log_summary("environment");
        Ok(config)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(url) = lookup("DATABASE_URL") {
            config.database.url = url;
        }
        if let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") {
            let parsed = raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                key: "DATABASE_MAX_CONNECTIONS".to_string(),
                value: raw.clone(),
            })?;
            config.database.max_connections = Some(parsed);
        }
        if let Some(raw) = lookup("SANDBOX_ISOLATION_LEVEL") {
            config.sandbox.isolation_level = Some(raw.parse()?);
        }
        if let Some(raw) = lookup("SANDBOX_PESSIMISTIC_LOCKS") {
            config.sandbox.pessimistic_locks = parse_flag("SANDBOX_PESSIMISTIC_LOCKS", &raw)?;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }

        Ok(config)
    }

    fn log_summary(&self, source: &str) {
        debug!(
            source,
            max_connections = ?self.database.max_connections,
            isolation_level = ?self.sandbox.isolation_level,
            pessimistic_locks = self.sandbox.pessimistic_locks,
            log_level = %self.log_level,
            "configuration loaded"
        );
    }
}

fn parse_flag(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        }),
    }
}
