//! Configuration loader with hierarchical merging.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::Config;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Database path cannot be empty")]
    EmptyDatabasePath,

    #[error("Transcript directory cannot be empty")]
    EmptyTranscriptDir,

    #[error("Invalid max_phase_retries: {0}. Must be at least 1")]
    InvalidMaxRetries(u32),

    #[error("Invalid max_delegation_depth: {0}. Must be at least 1")]
    InvalidMaxDepth(u32),

    #[error("Invalid coverage threshold {name}: {value}. Must be within 0.0..=1.0")]
    InvalidThreshold { name: String, value: f64 },
}

/// Loader merging defaults, project files, and environment variables.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `.curia/config.yaml` (project config)
    /// 3. `.curia/local.yaml` (local overrides, optional)
    /// 4. Environment variables (`CURIA_*` prefix)
    pub fn load() -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".curia/config.yaml"))
            .merge(Yaml::file(".curia/local.yaml"))
            .merge(Env::prefixed("CURIA_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        if config.database.path.is_empty() {
            return Err(ConfigError::EmptyDatabasePath);
        }
        if config.transcript.dir.is_empty() {
            return Err(ConfigError::EmptyTranscriptDir);
        }

        if config.run.max_phase_retries == 0 {
            return Err(ConfigError::InvalidMaxRetries(config.run.max_phase_retries));
        }
        if config.run.max_delegation_depth == 0 {
            return Err(ConfigError::InvalidMaxDepth(config.run.max_delegation_depth));
        }

        for (name, value) in &config.run.coverage_thresholds {
            if !(0.0..=1.0).contains(value) {
                return Err(ConfigError::InvalidThreshold {
                    name: name.clone(),
                    value: *value,
                });
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        ConfigLoader::validate(&Config::default()).unwrap();
    }

    #[test]
    fn test_load_from_file_merges_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "run:\n  max_phase_retries: 2\n  coverage_thresholds:\n    branch: 0.9\n    lines: 0.9"
        )
        .unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.run.max_phase_retries, 2);
        assert_eq!(config.run.coverage_thresholds["branch"], 0.9);
        // Untouched sections keep their defaults.
        assert_eq!(config.database.max_connections, 5);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "run:\n  coverage_thresholds:\n    branch: 1.5").unwrap();
        assert!(ConfigLoader::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let config = Config {
            logging: crate::domain::models::LoggingConfig {
                level: "loud".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            ConfigLoader::validate(&config),
            Err(ConfigError::InvalidLogLevel(_))
        ));
    }
}
