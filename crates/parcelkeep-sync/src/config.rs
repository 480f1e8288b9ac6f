// ABOUTME: Engine configuration loaded from PARCELKEEP_* environment variables.
// ABOUTME: Every knob has a default; malformed values are rejected instead of silently defaulted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parcelkeep_core::validate::DEFAULT_MAX_DATASET_BYTES;
use parcelkeep_core::Validator;
use parcelkeep_store::{DEFAULT_LOCAL_QUOTA_BYTES, SnapshotPolicy};
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} has invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub home: PathBuf,
    pub remote_url: Option<String>,
    pub local_quota_bytes: usize,
    pub max_dataset_bytes: usize,
    pub debounce: Duration,
    pub periodic_interval: Duration,
    pub min_save_gap: Duration,
    pub snapshot_retention_days: u32,
    pub compress_snapshots: bool,
    /// `None` retries queued remote writes forever.
    pub queue_max_attempts: Option<u32>,
    pub save_retries: u32,
    pub retry_base: Duration,
    pub cleanup_interval: Duration,
}

impl EngineConfig {
    /// Defaults rooted at `home`.
    pub fn for_home(home: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            remote_url: None,
            local_quota_bytes: DEFAULT_LOCAL_QUOTA_BYTES,
            max_dataset_bytes: DEFAULT_MAX_DATASET_BYTES,
            debounce: Duration::from_millis(1000),
            periodic_interval: Duration::from_secs(5),
            min_save_gap: Duration::from_secs(3),
            snapshot_retention_days: 7,
            compress_snapshots: true,
            queue_max_attempts: Some(25),
            save_retries: 3,
            retry_base: Duration::from_millis(1000),
            cleanup_interval: Duration::from_secs(60 * 60),
        }
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - PARCELKEEP_HOME: data directory (default: ~/.parcelkeep)
    /// - PARCELKEEP_REMOTE_URL: shared remote store base URL (optional)
    /// - PARCELKEEP_LOCAL_QUOTA_BYTES: local tier budget (default: 5 MiB)
    /// - PARCELKEEP_MAX_DATASET_BYTES: validator size ceiling (default: 50 MiB)
    /// - PARCELKEEP_DEBOUNCE_MS: debounce window for form input (default: 1000)
    /// - PARCELKEEP_PERIODIC_SECS: periodic save tick (default: 5)
    /// - PARCELKEEP_MIN_SAVE_GAP_SECS: minimum gap before a periodic save (default: 3)
    /// - PARCELKEEP_SNAPSHOT_RETENTION_DAYS: snapshot retention (default: 7)
    /// - PARCELKEEP_COMPRESS_SNAPSHOTS: gzip snapshots (default: true)
    /// - PARCELKEEP_QUEUE_MAX_ATTEMPTS: drains before dead-lettering, 0 for unbounded (default: 25)
    /// - PARCELKEEP_SAVE_RETRIES: coordinator retries before emergency backup (default: 3)
    /// - PARCELKEEP_RETRY_BASE_MS: linear backoff step between retries (default: 1000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let home = get("PARCELKEEP_HOME").map(PathBuf::from).unwrap_or_else(|| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".parcelkeep")
        });

        let mut config = Self::for_home(&home);
        config.remote_url = get("PARCELKEEP_REMOTE_URL");

        if let Some(v) = get("PARCELKEEP_LOCAL_QUOTA_BYTES") {
            config.local_quota_bytes = parse("PARCELKEEP_LOCAL_QUOTA_BYTES", &v)?;
        }
        if let Some(v) = get("PARCELKEEP_MAX_DATASET_BYTES") {
            config.max_dataset_bytes = parse("PARCELKEEP_MAX_DATASET_BYTES", &v)?;
        }
        if let Some(v) = get("PARCELKEEP_DEBOUNCE_MS") {
            config.debounce = Duration::from_millis(parse("PARCELKEEP_DEBOUNCE_MS", &v)?);
        }
        if let Some(v) = get("PARCELKEEP_PERIODIC_SECS") {
            let secs: u64 = parse("PARCELKEEP_PERIODIC_SECS", &v)?;
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    var: "PARCELKEEP_PERIODIC_SECS",
                    value: v,
                });
            }
            config.periodic_interval = Duration::from_secs(secs);
        }
        if let Some(v) = get("PARCELKEEP_MIN_SAVE_GAP_SECS") {
            config.min_save_gap = Duration::from_secs(parse("PARCELKEEP_MIN_SAVE_GAP_SECS", &v)?);
        }
        if let Some(v) = get("PARCELKEEP_SNAPSHOT_RETENTION_DAYS") {
            config.snapshot_retention_days = parse("PARCELKEEP_SNAPSHOT_RETENTION_DAYS", &v)?;
        }
        if let Some(v) = get("PARCELKEEP_COMPRESS_SNAPSHOTS") {
            config.compress_snapshots = parse_bool("PARCELKEEP_COMPRESS_SNAPSHOTS", &v)?;
        }
        if let Some(v) = get("PARCELKEEP_QUEUE_MAX_ATTEMPTS") {
            let max: u32 = parse("PARCELKEEP_QUEUE_MAX_ATTEMPTS", &v)?;
            config.queue_max_attempts = (max > 0).then_some(max);
        }
        if let Some(v) = get("PARCELKEEP_SAVE_RETRIES") {
            config.save_retries = parse("PARCELKEEP_SAVE_RETRIES", &v)?;
        }
        if let Some(v) = get("PARCELKEEP_RETRY_BASE_MS") {
            config.retry_base = Duration::from_millis(parse("PARCELKEEP_RETRY_BASE_MS", &v)?);
        }

        Ok(config)
    }

    pub fn local_dir(&self) -> PathBuf {
        self.home.join("local")
    }

    pub fn db_path(&self) -> PathBuf {
        self.home.join("parcelkeep.db")
    }

    pub fn validator(&self) -> Validator {
        Validator::new(self.max_dataset_bytes)
    }

    pub fn snapshot_policy(&self) -> SnapshotPolicy {
        SnapshotPolicy {
            retention: chrono::Duration::days(i64::from(self.snapshot_retention_days)),
            compress: self.compress_snapshots,
            ..SnapshotPolicy::default()
        }
    }
}

fn parse<T: std::str::FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        var,
        value: value.to_string(),
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid {
            var,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn config_loads_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[("PARCELKEEP_HOME", "/data/pk")])).unwrap();

        assert_eq!(config.home, PathBuf::from("/data/pk"));
        assert_eq!(config.local_dir(), PathBuf::from("/data/pk/local"));
        assert_eq!(config.db_path(), PathBuf::from("/data/pk/parcelkeep.db"));
        assert!(config.remote_url.is_none());
        assert_eq!(config.debounce, Duration::from_millis(1000));
        assert_eq!(config.periodic_interval, Duration::from_secs(5));
        assert_eq!(config.queue_max_attempts, Some(25));
        assert_eq!(config.snapshot_policy().retention, chrono::Duration::days(7));
        assert!(config.compress_snapshots);
    }

    #[test]
    fn config_reads_overrides() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("PARCELKEEP_REMOTE_URL", "http://sync.local"),
            ("PARCELKEEP_DEBOUNCE_MS", "250"),
            ("PARCELKEEP_COMPRESS_SNAPSHOTS", "no"),
            ("PARCELKEEP_QUEUE_MAX_ATTEMPTS", "0"),
            ("PARCELKEEP_SNAPSHOT_RETENTION_DAYS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.remote_url.as_deref(), Some("http://sync.local"));
        assert_eq!(config.debounce, Duration::from_millis(250));
        assert!(!config.compress_snapshots);
        assert_eq!(config.queue_max_attempts, None);
        assert_eq!(config.snapshot_policy().retention, chrono::Duration::days(3));
        assert!(config.home.to_string_lossy().contains(".parcelkeep"));
    }

    #[test]
    fn config_rejects_malformed_numbers() {
        let err = EngineConfig::from_lookup(lookup(&[("PARCELKEEP_DEBOUNCE_MS", "soon")])).unwrap_err();
        assert!(
            err.to_string().contains("PARCELKEEP_DEBOUNCE_MS"),
            "error should name the variable: {err}"
        );

        assert!(EngineConfig::from_lookup(lookup(&[("PARCELKEEP_PERIODIC_SECS", "0")])).is_err());
        assert!(EngineConfig::from_lookup(lookup(&[("PARCELKEEP_COMPRESS_SNAPSHOTS", "maybe")])).is_err());
    }
}
