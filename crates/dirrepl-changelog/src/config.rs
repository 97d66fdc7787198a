//! Changelog configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Settings of the changelog and its background tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
    /// Root directory of all changelog stores.
    pub db_dir: PathBuf,
    /// Replica id stamped on locally generated CSNs.
    pub local_replica_id: i16,
    /// Age after which records are purged; 0 disables purging.
    pub purge_delay_secs: u64,
    /// Pause between purge cycles.
    pub purge_interval_ms: u64,
    /// Whether changes are assigned change numbers.
    pub compute_change_number: bool,
    /// Domains never assigned change numbers.
    pub excluded_domains: Vec<String>,
    /// Idle time after which a session publishes a heartbeat.
    pub heartbeat_interval_ms: u64,
    /// How long shutdown waits for replica-offline notices to be forwarded.
    pub shutdown_grace_ms: u64,
    /// How long shutdown waits for a background task before aborting it.
    pub task_join_timeout_ms: u64,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("/var/lib/dirrepl/changelogDb"),
            local_replica_id: 1,
            purge_delay_secs: 3 * 24 * 60 * 60,
            purge_interval_ms: 10_000,
            compute_change_number: true,
            excluded_domains: vec!["cn=admin data".to_string(), "cn=schema".to_string()],
            heartbeat_interval_ms: 10_000,
            shutdown_grace_ms: 5_000,
            task_join_timeout_ms: 10_000,
        }
    }
}

impl ChangelogConfig {
    /// Loads a TOML or JSON file, picked by extension, and validates it.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ChangelogConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?,
            "json" => {
                serde_json::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))?
            }
            _ => return Err(ConfigError::UnsupportedFormat(ext.to_string())),
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms < 1_000 {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: format!("{} ms is below the 1 s minimum", self.heartbeat_interval_ms),
            });
        }
        for (field, value) in [
            ("purge_interval_ms", self.purge_interval_ms),
            ("shutdown_grace_ms", self.shutdown_grace_ms),
            ("task_join_timeout_ms", self.task_join_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Purge delay; zero disables purging.
    pub fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.purge_delay_secs)
    }

    /// Pause between purge cycles.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    /// Heartbeat idle interval.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Replica-offline grace window.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Bound on background task joins.
    pub fn task_join_timeout(&self) -> Duration {
        Duration::from_millis(self.task_join_timeout_ms)
    }

    /// Excluded domains as a set.
    pub fn excluded_domain_set(&self) -> HashSet<String> {
        self.excluded_domains.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ChangelogConfig::default();
        assert_eq!(config.purge_delay(), Duration::from_secs(259_200));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert!(config.compute_change_number);
        assert!(config.excluded_domain_set().contains("cn=admin data"));
        config.validate().unwrap();
    }

    #[test]
    fn test_sub_second_heartbeat_rejected() {
        let config = ChangelogConfig {
            heartbeat_interval_ms: 999,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_join_timeout_rejected() {
        let config = ChangelogConfig {
            task_join_timeout_ms: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_purge_delay_is_valid() {
        let config = ChangelogConfig {
            purge_delay_secs: 0,
            ..Default::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
db_dir = "/toml/changelog"
local_replica_id = 7
purge_delay_secs = 60
excluded_domains = ["cn=schema"]
            "#
        )
        .unwrap();

        let config = ChangelogConfig::from_file(file.path()).unwrap();
        assert_eq!(config.db_dir, PathBuf::from("/toml/changelog"));
        assert_eq!(config.local_replica_id, 7);
        assert_eq!(config.purge_delay_secs, 60);
        assert_eq!(config.excluded_domains, vec!["cn=schema"]);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{"db_dir": "/json/changelog", "compute_change_number": false}}"#
        )
        .unwrap();

        let config = ChangelogConfig::from_file(file.path()).unwrap();
        assert_eq!(config.db_dir, PathBuf::from("/json/changelog"));
        assert!(!config.compute_change_number);
    }

    #[test]
    fn test_from_file_invalid_values() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"heartbeat_interval_ms": 10}}"#).unwrap();
        assert!(matches!(
            ChangelogConfig::from_file(file.path()),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(matches!(
            ChangelogConfig::from_file(file.path()),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
