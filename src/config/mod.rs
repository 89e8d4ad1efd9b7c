//! Application configuration.
//!
//! Aggregates configuration for all services into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod server;
mod services;

pub use messaging::MessagingConfig;
pub use server::{ServerConfig, StorageConfig};
pub use services::{MeshConfig, PulseConfig, SagaConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "MESHWARDEN_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "MESHWARDEN";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "MESHWARDEN_LOG";

use serde::Deserialize;

/// A sidecar endpoint seeded into the topology registry at startup.
///
/// The registry is normally written by an external configuration process;
/// seeds cover bootstrap and single-node deployments.
#[derive(Debug, Clone, Deserialize)]
pub struct SidecarSeed {
    /// Unique sidecar name.
    pub name: String,
    /// Internal base URL.
    pub url: String,
    /// Externally reachable base URL, preferred for probing and tool calls.
    #[serde(default)]
    pub host_url: Option<String>,
    /// Number of tools the sidecar declares.
    #[serde(default)]
    pub tools_count: i64,
    /// Free-form grouping label.
    #[serde(default)]
    pub category: Option<String>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Durable store configuration.
    pub storage: StorageConfig,
    /// Broker configuration (optional; without it the dead-letter listener
    /// and the task-queue escalation channel are disabled).
    pub messaging: Option<MessagingConfig>,
    /// Mesh discovery configuration.
    pub mesh: MeshConfig,
    /// Pulse detection and dispatch configuration.
    pub pulse: PulseConfig,
    /// Saga execution configuration.
    pub saga: SagaConfig,
    /// Sidecars seeded into the topology registry at startup.
    pub sidecars: Vec<SidecarSeed>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-memory storage, no broker.
    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.server.port, 8180);
        assert!(config.messaging.is_none());
        assert!(config.sidecars.is_empty());
    }

    #[test]
    fn test_config_for_test() {
        let config = Config::for_test();
        assert_eq!(config.storage.database_url, "sqlite::memory:");
        assert_eq!(config.mesh.sweep_interval_secs, 30);
        assert_eq!(config.pulse.event_log_capacity, 200);
    }

    #[test]
    fn test_sidecar_seed_deserializes_with_defaults() {
        let yaml = "name: billing\nurl: http://localhost:8191";
        let seed: SidecarSeed = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(seed.name, "billing");
        assert!(seed.host_url.is_none());
        assert_eq!(seed.tools_count, 0);
    }
}
