use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_DB_FILE: &str = "shardvault.db";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Root of the shard tree: `<base_path>/<shard1>/<shard2>/<sequence>.<ext>`.
    pub base_path: PathBuf,
    /// SQLite index file. Defaults to `<base_path>/shardvault.db`.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    #[serde(default)]
    pub allocation: AllocationConfig,
}

/// Bounded exponential backoff for sequence allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl AllocationConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_max_attempts() -> u32 {
    8
}

fn default_initial_backoff_ms() -> u64 {
    5
}

fn default_max_backoff_ms() -> u64 {
    250
}

impl VaultConfig {
    pub fn with_base_path(path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: path.into(),
            db_path: None,
            busy_timeout_ms: default_busy_timeout_ms(),
            allocation: AllocationConfig::default(),
        }
    }

    /// Load from a config file, with `SHARDVAULT__*` environment overrides
    /// (e.g. `SHARDVAULT__ALLOCATION__MAX_ATTEMPTS=4`).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()))
            .add_source(::config::Environment::with_prefix("SHARDVAULT").separator("__"))
            .build()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        let config: VaultConfig = settings
            .try_deserialize()
            .map_err(|e| VaultError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allocation.max_attempts == 0 {
            return Err(VaultError::Config(
                "allocation.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.allocation.initial_backoff_ms > self.allocation.max_backoff_ms {
            return Err(VaultError::Config(format!(
                "allocation.initial_backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.allocation.initial_backoff_ms, self.allocation.max_backoff_ms
            )));
        }
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.base_path.join(DEFAULT_DB_FILE))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = VaultConfig::with_base_path("/srv/images");
        assert_eq!(config.db_path(), PathBuf::from("/srv/images/shardvault.db"));
        assert_eq!(config.busy_timeout(), Duration::from_secs(5));
        assert_eq!(config.allocation.max_attempts, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let allocation = AllocationConfig {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(allocation.backoff_for(1), Duration::from_millis(10));
        assert_eq!(allocation.backoff_for(2), Duration::from_millis(20));
        assert_eq!(allocation.backoff_for(3), Duration::from_millis(40));
        assert_eq!(allocation.backoff_for(4), Duration::from_millis(50));
        assert_eq!(allocation.backoff_for(40), Duration::from_millis(50));
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("vault.toml");
        std::fs::write(
            &path,
            "base_path = \"/data/vault\"\n\n[allocation]\nmax_attempts = 3\n",
        )
        .unwrap();

        let config = VaultConfig::from_file(&path).unwrap();
        assert_eq!(config.base_path, PathBuf::from("/data/vault"));
        assert_eq!(config.allocation.max_attempts, 3);
        assert_eq!(config.allocation.initial_backoff_ms, 5);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert!(config.db_path.is_none());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = VaultConfig::with_base_path("/tmp/vault");
        config.allocation.max_attempts = 0;
        assert!(matches!(config.validate(), Err(VaultError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = VaultConfig::from_file("/nonexistent/shardvault.toml");
        assert!(matches!(result, Err(VaultError::Config(_))));
    }
}
