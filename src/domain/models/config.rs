//! Configuration models.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::run::PermissionMode;

/// Main configuration structure for curia.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Skills-loop run configuration.
    #[serde(default)]
    pub run: RunConfig,

    /// Playbook database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Transcript storage configuration.
    #[serde(default)]
    pub transcript: TranscriptConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for a single skills-loop run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RunConfig {
    /// Required coverage ratios for proof validation, keyed by metric name.
    #[serde(default = "default_coverage_thresholds")]
    pub coverage_thresholds: BTreeMap<String, f64>,

    /// Maximum retries per re-entered phase before the run aborts.
    #[serde(default = "default_max_phase_retries")]
    pub max_phase_retries: u32,

    /// Maximum nesting depth of delegated subagents.
    #[serde(default = "default_max_delegation_depth")]
    pub max_delegation_depth: u32,

    /// Overall run deadline.
    #[serde(default = "default_run_timeout_seconds")]
    pub run_timeout_seconds: u64,

    /// Default per-session deadline for delegated subagents.
    #[serde(default = "default_subagent_timeout_seconds")]
    pub subagent_timeout_seconds: u64,

    /// Numeric tolerance for consensus convergence.
    #[serde(default = "default_consensus_tolerance")]
    pub consensus_tolerance: f64,

    /// Permission mode runs start with unless overridden per run.
    #[serde(default = "default_permission_mode")]
    pub default_permission_mode: PermissionMode,

    /// Explicit override allowing degraded proof bundles to be accepted.
    /// Every use is logged and recorded in the transcript.
    #[serde(default)]
    pub allow_degraded_proof: bool,

    /// Minimum confidence for proposals that carry a confidence score;
    /// 0.0 disables the floor.
    #[serde(default)]
    pub min_delta_confidence: f64,
}

fn default_coverage_thresholds() -> BTreeMap<String, f64> {
    BTreeMap::from([("branch".to_string(), 0.80), ("lines".to_string(), 0.85)])
}

const fn default_max_phase_retries() -> u32 {
    3
}

const fn default_max_delegation_depth() -> u32 {
    2
}

const fn default_run_timeout_seconds() -> u64 {
    3600
}

const fn default_subagent_timeout_seconds() -> u64 {
    300
}

const fn default_consensus_tolerance() -> f64 {
    1e-6
}

const fn default_permission_mode() -> PermissionMode {
    PermissionMode::AcceptEdits
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            coverage_thresholds: default_coverage_thresholds(),
            max_phase_retries: default_max_phase_retries(),
            max_delegation_depth: default_max_delegation_depth(),
            run_timeout_seconds: default_run_timeout_seconds(),
            subagent_timeout_seconds: default_subagent_timeout_seconds(),
            consensus_tolerance: default_consensus_tolerance(),
            default_permission_mode: default_permission_mode(),
            allow_degraded_proof: false,
            min_delta_confidence: 0.0,
        }
    }
}

/// Playbook database configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct DatabaseConfig {
    /// Path to the `SQLite` playbook database file.
    #[serde(default = "default_database_path")]
    pub path: String,

    /// Maximum number of database connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_database_path() -> String {
    ".curia/playbook.db".to_string()
}

const fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            max_connections: default_max_connections(),
        }
    }
}

/// Transcript storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TranscriptConfig {
    /// Directory holding one newline-delimited JSON file per run.
    #[serde(default = "default_transcript_dir")]
    pub dir: String,
}

fn default_transcript_dir() -> String {
    ".curia/transcripts".to_string()
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            dir: default_transcript_dir(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty.
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Optional directory for file output; stderr only when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds_match_curation_policy() {
        let config = RunConfig::default();
        assert_eq!(config.coverage_thresholds.get("branch"), Some(&0.80));
        assert_eq!(config.coverage_thresholds.get("lines"), Some(&0.85));
    }

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.run.max_phase_retries, 3);
        assert_eq!(config.run.max_delegation_depth, 2);
        assert!(!config.run.allow_degraded_proof);
        assert_eq!(config.database.path, ".curia/playbook.db");
        assert_eq!(config.transcript.dir, ".curia/transcripts");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r"
run:
  max_phase_retries: 1
logging:
  level: debug
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.run.max_phase_retries, 1);
        assert_eq!(config.run.max_delegation_depth, 2);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
    }
}
