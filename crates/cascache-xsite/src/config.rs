//! Configuration for cross-site replication of one cache.

use crate::error::{Result, XSiteError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Built-in merge policy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicyKind {
    /// Deterministic tie-break by site name.
    #[default]
    Default,
    /// A live value beats a deletion.
    PreferNonNull,
    /// A deletion beats a live value.
    PreferNull,
    /// Every conflict resolves to a deletion.
    AlwaysRemove,
}

/// Backoff settings for retrying a backup site after link failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackOffConfig {
    /// First delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Ceiling for the delay in milliseconds.
    pub max_delay_ms: u64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for BackOffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 300_000,
            jitter: true,
        }
    }
}

/// One asynchronous backup site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSiteConfig {
    /// Remote site name.
    pub name: String,
    /// Backoff override for this site.
    #[serde(default)]
    pub backoff: Option<BackOffConfig>,
}

impl BackupSiteConfig {
    /// Backup site with the default backoff.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backoff: None,
        }
    }
}

/// Replication Coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IracConfig {
    /// Maximum number of keys sent in one request.
    pub batch_size: usize,
    /// Wait before retrying after a non-transient failure (ms).
    pub retry_delay_ms: u64,
}

impl Default for IracConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            retry_delay_ms: 100,
        }
    }
}

/// Tombstone Manager settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Tombstone count the cleanup scheduler aims for.
    pub target_size: usize,
    /// Upper bound of the cleanup delay (ms).
    pub max_cleanup_delay_ms: u64,
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            target_size: 32_768,
            max_cleanup_delay_ms: 300_000,
        }
    }
}

/// Cross-site replication configuration of one cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct XSiteConfig {
    /// Cache name.
    pub cache_name: String,
    /// Name of the local site.
    pub local_site: String,
    /// Asynchronous backup sites.
    pub backups: Vec<BackupSiteConfig>,
    /// Conflict resolution policy.
    pub merge_policy: MergePolicyKind,
    /// Replication Coordinator settings.
    pub irac: IracConfig,
    /// Tombstone settings.
    pub tombstones: TombstoneConfig,
    /// Default backoff for all backup sites.
    pub backoff: BackOffConfig,
    /// Whether statistics are collected from start.
    pub statistics_enabled: bool,
    /// File used to persist versions across restarts.
    pub global_state_path: Option<PathBuf>,
}

impl Default for XSiteConfig {
    fn default() -> Self {
        Self {
            cache_name: "default".to_string(),
            local_site: "site-1".to_string(),
            backups: Vec::new(),
            merge_policy: MergePolicyKind::Default,
            irac: IracConfig::default(),
            tombstones: TombstoneConfig::default(),
            backoff: BackOffConfig::default(),
            statistics_enabled: true,
            global_state_path: None,
        }
    }
}

impl XSiteConfig {
    /// Configuration for `cache_name` at `local_site` replicating to `backups`.
    pub fn new(cache_name: &str, local_site: &str, backups: &[&str]) -> Self {
        Self {
            cache_name: cache_name.to_string(),
            local_site: local_site.to_string(),
            backups: backups.iter().map(|b| BackupSiteConfig::new(*b)).collect(),
            ..Default::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: XSiteConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| XSiteError::Config {
                msg: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| XSiteError::Config {
                msg: e.to_string(),
            })?,
            _ => {
                return Err(XSiteError::Config {
                    msg: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the subsystem cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(XSiteError::Config { msg }) };

        if self.local_site.is_empty() {
            return fail("local site name is empty".to_string());
        }
        let mut seen = HashSet::new();
        for backup in &self.backups {
            if backup.name == self.local_site {
                return fail(format!("site {} cannot back up to itself", backup.name));
            }
            if !seen.insert(backup.name.as_str()) {
                return fail(format!("duplicate backup site {}", backup.name));
            }
        }
        if self.irac.batch_size == 0 {
            return fail("irac.batch_size must be positive".to_string());
        }
        if self.tombstones.target_size == 0 {
            return fail("tombstones.target_size must be positive".to_string());
        }
        if self.tombstones.max_cleanup_delay_ms == 0 {
            return fail("tombstones.max_cleanup_delay_ms must be positive".to_string());
        }
        Ok(())
    }

    /// Names of the backup sites.
    pub fn backup_names(&self) -> Vec<String> {
        self.backups.iter().map(|b| b.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn temp_file(suffix: &str) -> NamedTempFile {
        tempfile::Builder::new().suffix(suffix).tempfile().unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = XSiteConfig::default();
        assert_eq!(config.irac.batch_size, 128);
        assert_eq!(config.irac.retry_delay_ms, 100);
        assert_eq!(config.tombstones.target_size, 32_768);
        assert_eq!(config.tombstones.max_cleanup_delay_ms, 300_000);
        assert_eq!(config.backoff.initial_delay_ms, 500);
        assert!(config.statistics_enabled);
        assert_eq!(config.merge_policy, MergePolicyKind::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = temp_file(".toml");
        writeln!(
            file,
            r#"
cache_name = "users"
local_site = "LON"
merge_policy = "prefer-non-null"

[[backups]]
name = "NYC"

[[backups]]
name = "SFO"
backoff = {{ initial_delay_ms = 10, max_delay_ms = 100, jitter = false }}

[tombstones]
target_size = 5
max_cleanup_delay_ms = 1000
"#
        )
        .unwrap();

        let config = XSiteConfig::from_file(file.path()).unwrap();
        assert_eq!(config.cache_name, "users");
        assert_eq!(config.backup_names(), vec!["NYC", "SFO"]);
        assert_eq!(config.merge_policy, MergePolicyKind::PreferNonNull);
        assert_eq!(config.tombstones.target_size, 5);
        assert_eq!(config.irac.batch_size, 128);
        assert_eq!(config.backups[1].backoff.as_ref().unwrap().max_delay_ms, 100);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = temp_file(".json");
        writeln!(
            file,
            r#"{{"cache_name": "orders", "local_site": "NYC", "backups": [{{"name": "LON"}}], "merge_policy": "always-remove"}}"#
        )
        .unwrap();

        let config = XSiteConfig::from_file(file.path()).unwrap();
        assert_eq!(config.local_site, "NYC");
        assert_eq!(config.merge_policy, MergePolicyKind::AlwaysRemove);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = temp_file(".yaml");
        let err = XSiteConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, XSiteError::Config { .. }));
    }

    #[test]
    fn test_validate_rejects_self_backup() {
        let config = XSiteConfig::new("c", "LON", &["LON"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let config = XSiteConfig::new("c", "LON", &["NYC", "NYC"]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = XSiteConfig::new("c", "LON", &["NYC"]);
        config.irac.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = XSiteConfig::new("c", "LON", &["NYC"]);
        config.tombstones.max_cleanup_delay_ms = 0;
        assert!(config.validate().is_err());
    }
}
