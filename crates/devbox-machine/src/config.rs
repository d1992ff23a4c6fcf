use thiserror::Error;

use crate::servers::{ParseStrategyError, ServerStrategyKind};

pub const DEFAULT_EXTERNAL_HOST: &str = "localhost";

pub const ENV_REGISTRY: &str = "DEVBOX_REGISTRY";
pub const ENV_REGISTRY_NAMESPACE: &str = "DEVBOX_REGISTRY_NAMESPACE";
pub const ENV_SNAPSHOT_USE_REGISTRY: &str = "DEVBOX_SNAPSHOT_USE_REGISTRY";
pub const ENV_SERVER_STRATEGY: &str = "DEVBOX_SERVER_STRATEGY";
pub const ENV_EXTERNAL_HOST: &str = "DEVBOX_EXTERNAL_HOST";

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MachineConfig {
    pub registry: Option<String>,
    pub registry_namespace: Option<String>,
    pub snapshot_use_registry: bool,
    pub server_strategy: ServerStrategyKind,
    pub external_host: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            registry: None,
            registry_namespace: None,
            snapshot_use_registry: false,
            server_strategy: ServerStrategyKind::default(),
            external_host: DEFAULT_EXTERNAL_HOST.to_string(),
        }
    }
}

#[derive(Debug, Eq, Error, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Strategy(#[from] ParseStrategyError),
    #[error("invalid boolean for {var}: `{value}` (expected true/false/1/0)")]
    InvalidFlag { var: &'static str, value: String },
    #[error("DEVBOX_SNAPSHOT_USE_REGISTRY is enabled but DEVBOX_REGISTRY is not set")]
    MissingRegistry,
}

impl MachineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for unset or
    /// blank values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let value = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        let mut config = Self {
            registry: value(ENV_REGISTRY),
            registry_namespace: value(ENV_REGISTRY_NAMESPACE)
                .map(|ns| ns.trim_matches('/').to_string())
                .filter(|ns| !ns.is_empty()),
            ..Self::default()
        };
        if let Some(raw) = value(ENV_SNAPSHOT_USE_REGISTRY) {
            config.snapshot_use_registry = parse_flag(ENV_SNAPSHOT_USE_REGISTRY, &raw)?;
        }
        if let Some(raw) = value(ENV_SERVER_STRATEGY) {
            config.server_strategy = raw.parse()?;
        }
        if let Some(host) = value(ENV_EXTERNAL_HOST) {
            config.external_host = host;
        }
        if config.snapshot_use_registry && config.registry.is_none() {
            return Err(ConfigError::MissingRegistry);
        }
        Ok(config)
    }
}

fn parse_flag(var: &'static str, raw: &str) -> Result<bool, ConfigError> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidFlag {
            var,
            value: raw.to_string(),
        }),
    }
}
