// SPDX-License-Identifier: MIT
//! Configuration struct and its defaults (SPEC_FULL.md §12). Loading the
//! TOML file itself — finding it on disk, watching it for changes — is the
//! transport/installer's job per spec.md §1's Non-goals; this module only
//! defines the struct and the three-tier precedence (CLI/env > TOML >
//! built-in default) so the rest of the core can be constructed from it.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::error;

const DEFAULT_LOG_PATHS: &[&str] = &["/var/log/exim4/mainlog"];
const DEFAULT_SPOOL_DIR: &str = "/var/spool/exim4";
const DEFAULT_BINARY_PATH: &str = "/usr/sbin/exim4";
const DEFAULT_DB_PATH: &str = "/var/lib/queuewatch/queuewatch.db";
const DEFAULT_DB_MAX_OPEN_CONNS: u32 = 25;
const DEFAULT_LOG_ENTRIES_RETENTION_DAYS: i64 = 90;
const DEFAULT_ATTEMPTS_RETENTION_DAYS: i64 = 180;
const DEFAULT_AUDIT_RETENTION_DAYS: i64 = 365;
const DEFAULT_SNAPSHOT_RETENTION_DAYS: i64 = 30;
const DEFAULT_RETENTION_CLEANUP_INTERVAL_HOURS: u64 = 24;
const DEFAULT_SNAPSHOT_INTERVAL_SECONDS: u64 = 60;
const DEFAULT_OP_TIMEOUT_LIST_SECS: u64 = 10;
const DEFAULT_OP_TIMEOUT_INSPECT_SECS: u64 = 30;
const DEFAULT_OP_TIMEOUT_MANIPULATE_SECS: u64 = 15;
const DEFAULT_BULK_CONCURRENCY_LIMIT: usize = 4;
const DEFAULT_BULK_MAX_SIZE: usize = 1000;
const DEFAULT_SUBSCRIBER_BUFFER_SIZE: usize = 256;

/// `config.toml` shape — every field optional, since any of them may
/// instead be supplied via CLI flag or environment variable.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    log_paths: Option<Vec<String>>,
    spool_dir: Option<String>,
    binary_path: Option<String>,
    db_path: Option<String>,
    db_max_open_conns: Option<u32>,
    retention: Option<TomlRetention>,
    snapshot_interval_seconds: Option<u64>,
    op_timeouts: Option<TomlOpTimeouts>,
    bulk_concurrency_limit: Option<usize>,
    bulk_max_size: Option<usize>,
    subscriber_buffer_size: Option<usize>,
    historical_import: Option<bool>,
    log_level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlRetention {
    log_entries_days: Option<i64>,
    delivery_attempts_days: Option<i64>,
    audit_entries_days: Option<i64>,
    queue_snapshots_days: Option<i64>,
    cleanup_interval_hours: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlOpTimeouts {
    list_seconds: Option<u64>,
    inspect_seconds: Option<u64>,
    manipulate_seconds: Option<u64>,
}

fn load_toml(path: &std::path::Path) -> Option<TomlConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

/// CLI/env overrides, mirrored 1:1 onto [`Config`] fields. All `Option`s here
/// win over the TOML layer, which in turn wins over built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub log_paths: Option<Vec<PathBuf>>,
    pub spool_dir: Option<PathBuf>,
    pub binary_path: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub db_max_open_conns: Option<u32>,
    pub log_level: Option<String>,
    pub historical_import: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub log_entries_days: i64,
    pub delivery_attempts_days: i64,
    pub audit_entries_days: i64,
    pub queue_snapshots_days: i64,
    pub cleanup_interval_hours: u64,
}

#[derive(Debug, Clone)]
pub struct OpTimeoutSettings {
    pub list_seconds: u64,
    pub inspect_seconds: u64,
    pub manipulate_seconds: u64,
}

/// Fully resolved configuration for one run of the core (spec.md §6.4).
#[derive(Debug, Clone)]
pub struct Config {
    pub log_paths: Vec<PathBuf>,
    pub spool_dir: PathBuf,
    pub binary_path: PathBuf,
    pub db_path: PathBuf,
    pub db_max_open_conns: u32,
    pub retention: RetentionSettings,
    pub snapshot_interval_seconds: u64,
    pub op_timeouts: OpTimeoutSettings,
    pub bulk_concurrency_limit: usize,
    /// Max ids accepted by one bulk `Operate` call (spec.md §8 "bulk op size
    /// cap configurable (default 1000)"). Larger requests are rejected with
    /// a validation error before any subprocess is spawned.
    pub bulk_max_size: usize,
    pub subscriber_buffer_size: usize,
    pub historical_import: bool,
    pub log_level: String,
}

impl Config {
    /// Resolve config from a TOML file (if present at `toml_path`) plus
    /// explicit overrides, following the CLI/env > TOML > default precedence.
    pub fn load(toml_path: Option<&std::path::Path>, overrides: ConfigOverrides) -> Self {
        let toml = toml_path.and_then(load_toml).unwrap_or_default();

        let log_paths = overrides
            .log_paths
            .or_else(|| toml.log_paths.map(|v| v.into_iter().map(PathBuf::from).collect()))
            .unwrap_or_else(|| DEFAULT_LOG_PATHS.iter().map(PathBuf::from).collect());

        let spool_dir = overrides
            .spool_dir
            .or_else(|| toml.spool_dir.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SPOOL_DIR));

        let binary_path = overrides
            .binary_path
            .or_else(|| toml.binary_path.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_BINARY_PATH));

        let db_path = overrides
            .db_path
            .or_else(|| toml.db_path.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB_PATH));

        let db_max_open_conns = overrides
            .db_max_open_conns
            .or(toml.db_max_open_conns)
            .unwrap_or(DEFAULT_DB_MAX_OPEN_CONNS);

        let toml_retention = toml.retention.unwrap_or_default();
        let retention = RetentionSettings {
            log_entries_days: toml_retention.log_entries_days.unwrap_or(DEFAULT_LOG_ENTRIES_RETENTION_DAYS),
            delivery_attempts_days: toml_retention.delivery_attempts_days.unwrap_or(DEFAULT_ATTEMPTS_RETENTION_DAYS),
            audit_entries_days: toml_retention.audit_entries_days.unwrap_or(DEFAULT_AUDIT_RETENTION_DAYS),
            queue_snapshots_days: toml_retention.queue_snapshots_days.unwrap_or(DEFAULT_SNAPSHOT_RETENTION_DAYS),
            cleanup_interval_hours: toml_retention.cleanup_interval_hours.unwrap_or(DEFAULT_RETENTION_CLEANUP_INTERVAL_HOURS),
        };

        let snapshot_interval_seconds = toml.snapshot_interval_seconds.unwrap_or(DEFAULT_SNAPSHOT_INTERVAL_SECONDS);

        let toml_timeouts = toml.op_timeouts.unwrap_or_default();
        let op_timeouts = OpTimeoutSettings {
            list_seconds: toml_timeouts.list_seconds.unwrap_or(DEFAULT_OP_TIMEOUT_LIST_SECS),
            inspect_seconds: toml_timeouts.inspect_seconds.unwrap_or(DEFAULT_OP_TIMEOUT_INSPECT_SECS),
            manipulate_seconds: toml_timeouts.manipulate_seconds.unwrap_or(DEFAULT_OP_TIMEOUT_MANIPULATE_SECS),
        };

        let bulk_concurrency_limit = toml.bulk_concurrency_limit.unwrap_or(DEFAULT_BULK_CONCURRENCY_LIMIT);
        let bulk_max_size = toml.bulk_max_size.unwrap_or(DEFAULT_BULK_MAX_SIZE);
        let subscriber_buffer_size = toml.subscriber_buffer_size.unwrap_or(DEFAULT_SUBSCRIBER_BUFFER_SIZE);

        let historical_import = overrides.historical_import.or(toml.historical_import).unwrap_or(false);

        let log_level = overrides.log_level.or(toml.log_level).unwrap_or_else(|| "info".to_string());

        Self {
            log_paths,
            spool_dir,
            binary_path,
            db_path,
            db_max_open_conns,
            retention,
            snapshot_interval_seconds,
            op_timeouts,
            bulk_concurrency_limit,
            bulk_max_size,
            subscriber_buffer_size,
            historical_import,
            log_level,
        }
    }
}

impl From<&OpTimeoutSettings> for crate::queue::OpTimeouts {
    fn from(settings: &OpTimeoutSettings) -> Self {
        crate::queue::OpTimeouts {
            list: std::time::Duration::from_secs(settings.list_seconds),
            inspect: std::time::Duration::from_secs(settings.inspect_seconds),
            manipulate: std::time::Duration::from_secs(settings.manipulate_seconds),
        }
    }
}

impl From<&RetentionSettings> for crate::store::RetentionConfig {
    fn from(settings: &RetentionSettings) -> Self {
        crate::store::RetentionConfig {
            log_entries_days: settings.log_entries_days,
            delivery_attempts_days: settings.delivery_attempts_days,
            audit_entries_days: settings.audit_entries_days,
            queue_snapshots_days: settings.queue_snapshots_days,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_with_no_toml_and_no_overrides() {
        let config = Config::load(None, ConfigOverrides::default());
        assert_eq!(config.binary_path, PathBuf::from(DEFAULT_BINARY_PATH));
        assert_eq!(config.db_max_open_conns, DEFAULT_DB_MAX_OPEN_CONNS);
        assert_eq!(config.log_level, "info");
        assert!(!config.historical_import);
        assert_eq!(config.bulk_max_size, DEFAULT_BULK_MAX_SIZE);
    }

    #[test]
    fn override_wins_over_toml_and_default() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "binary_path = \"/opt/exim/bin/exim\"\n").unwrap();

        let overrides = ConfigOverrides {
            binary_path: Some(PathBuf::from("/custom/exim")),
            ..Default::default()
        };
        let config = Config::load(Some(&toml_path), overrides);
        assert_eq!(config.binary_path, PathBuf::from("/custom/exim"));
    }

    #[test]
    fn toml_wins_over_default_when_no_override() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("config.toml");
        std::fs::write(&toml_path, "binary_path = \"/opt/exim/bin/exim\"\n").unwrap();

        let config = Config::load(Some(&toml_path), ConfigOverrides::default());
        assert_eq!(config.binary_path, PathBuf::from("/opt/exim/bin/exim"));
    }
}
