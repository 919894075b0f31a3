//! Configuration loading and path resolution
//!
//! Config file resolution follows this priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable (`LINECOUNT_CONFIG`)
//! 3. Platform config file (`<config_dir>/linecount/config.toml`, then `/etc/linecount/config.toml`)
//! 4. Compiled defaults (fallback)

use crate::{Error, Result, RetryPolicy};
use chrono::NaiveTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_ENV_VAR: &str = "LINECOUNT_CONFIG";

/// Complete station configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StationConfig {
    /// Lines this station counts for (plan pull scope)
    pub lines: Vec<String>,
    /// Plant offset from UTC in minutes (negative west of Greenwich)
    pub utc_offset_minutes: i32,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    pub pairing: PairingConfig,
    pub lifecycle: LifecycleConfig,
    pub sync: SyncConfig,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            lines: vec!["M1".to_string()],
            utc_offset_minutes: -360,
            local: LocalConfig::default(),
            remote: RemoteConfig::default(),
            pairing: PairingConfig::default(),
            lifecycle: LifecycleConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

/// Local SQLite store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Database file; platform data dir when unset
    pub db_path: Option<PathBuf>,
    /// SQLite busy_timeout before a lock error surfaces to the retry loop
    pub busy_timeout_ms: u64,
    pub lock_retry: RetryPolicy,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: 250,
            lock_retry: RetryPolicy::default(),
        }
    }
}

/// Remote store settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// `mysql://...` or `sqlite://...`; station runs local-only when unset
    pub url: Option<String>,
    pub connect_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub max_connections: u32,
    pub retry: RetryPolicy,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: None,
            connect_timeout_secs: 5,
            io_timeout_secs: 10,
            max_connections: 4,
            retry: RetryPolicy {
                max_attempts: 2,
                initial_backoff_ms: 200,
                max_backoff_ms: 1000,
            },
        }
    }
}

impl RemoteConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }
}

/// Pairing engine settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PairingConfig {
    /// How recent an opposite-format half must be to pair
    pub match_window_secs: u64,
    /// Age after which staging halves are purged
    pub cleanup_horizon_secs: u64,
    /// Require lot numbers to agree when both halves carry one
    pub match_lot_no: bool,
    /// Validate BARCODE main part against its QR sub-assembly
    pub cross_ref_mode: bool,
    /// Every QR completes immediately with a synthetic BARCODE half
    pub solo_mode: bool,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            match_window_secs: 10,
            cleanup_horizon_secs: 30,
            match_lot_no: true,
            cross_ref_mode: false,
            solo_mode: false,
        }
    }
}

/// Work-order lifecycle settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Seconds without completions before an ACTIVE plan pauses (0 disables)
    pub inactivity_pause_secs: u64,
    /// Local wall-clock times ("HH:MM") at which open plans close
    pub closure_checkpoints: Vec<String>,
    /// Reject scans for parts with no plan on the line
    pub require_plan: bool,
    /// Operators per line, used for units-per-person-hour
    pub headcount: HashMap<String, u32>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            inactivity_pause_secs: 0,
            closure_checkpoints: vec!["23:59".to_string()],
            require_plan: true,
            headcount: HashMap::new(),
        }
    }
}

impl LifecycleConfig {
    /// Parsed closure checkpoints
    pub fn closure_times(&self) -> Result<Vec<NaiveTime>> {
        self.closure_checkpoints
            .iter()
            .map(|s| {
                NaiveTime::parse_from_str(s.trim(), "%H:%M")
                    .map_err(|e| Error::Config(format!("invalid closure checkpoint '{}': {}", s, e)))
            })
            .collect()
    }
}

/// Sync coordinator settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub unit_push_interval_secs: u64,
    pub plan_pull_interval_secs: u64,
    pub increment_push_interval_secs: u64,
    pub inactivity_check_interval_secs: u64,
    pub closure_poll_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Seconds remote I/O is skipped after a connection failure
    pub offline_window_secs: u64,
    pub batch_size: u32,
    pub shutdown_drain_cycles: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            unit_push_interval_secs: 4,
            plan_pull_interval_secs: 15,
            increment_push_interval_secs: 15,
            inactivity_check_interval_secs: 30,
            closure_poll_interval_secs: 60,
            cleanup_interval_secs: 60,
            offline_window_secs: 120,
            batch_size: 100,
            shutdown_drain_cycles: 5,
        }
    }
}

impl StationConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: StationConfig = toml::from_str(content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file path
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Resolve the config file per the priority order and load it
    ///
    /// Returns the config plus the file it came from (None when defaults were used).
    pub fn load(cli_arg: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        match resolve_config_path(cli_arg, CONFIG_ENV_VAR) {
            Some(path) => {
                let config = Self::from_file(&path)?;
                Ok((config, Some(path)))
            }
            None => Ok((Self::default(), None)),
        }
    }

    /// Reject settings the station cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.lines.is_empty() {
            return Err(Error::Config("at least one line must be configured".to_string()));
        }
        if self.pairing.match_window_secs == 0 {
            return Err(Error::Config("pairing.match_window_secs must be > 0".to_string()));
        }
        if self.pairing.cleanup_horizon_secs < self.pairing.match_window_secs {
            return Err(Error::Config(
                "pairing.cleanup_horizon_secs must not be shorter than the match window".to_string(),
            ));
        }
        if self.pairing.solo_mode && self.pairing.cross_ref_mode {
            return Err(Error::Config(
                "pairing.solo_mode and pairing.cross_ref_mode are mutually exclusive".to_string(),
            ));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::Config("sync.batch_size must be > 0".to_string()));
        }
        self.lifecycle.closure_times()?;
        crate::WorkCalendar::from_offset_minutes(self.utc_offset_minutes)?;
        Ok(())
    }

    /// Local database path, falling back to the platform data dir
    pub fn local_db_path(&self) -> PathBuf {
        self.local
            .db_path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("linecount.db"))
    }

    /// Lines normalized the same way scans are
    pub fn normalized_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .lines
            .iter()
            .map(|l| l.trim().to_uppercase())
            .filter(|l| !l.is_empty())
            .collect();
        lines.dedup();
        lines
    }
}

/// Config file resolution: CLI argument, then environment variable, then platform file
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    let user_config = dirs::config_dir().map(|d| d.join("linecount").join("config.toml"));
    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    let system_config = PathBuf::from("/etc/linecount/config.toml");
    if cfg!(unix) && system_config.exists() {
        return Some(system_config);
    }

    None
}

/// OS-dependent default data folder
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("linecount"))
        .unwrap_or_else(|| PathBuf::from("./linecount_data"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.pairing.match_window_secs, 10);
        assert_eq!(config.pairing.cleanup_horizon_secs, 30);
        assert_eq!(config.sync.offline_window_secs, 120);
        assert_eq!(config.sync.batch_size, 100);
    }

    #[test]
    fn test_partial_toml_keeps_section_defaults() {
        let config = StationConfig::from_toml_str(
            r#"
            lines = ["m1", "M2"]

            [pairing]
            match_lot_no = false

            [lifecycle]
            closure_checkpoints = ["14:00", "23:59"]
            "#,
        )
        .unwrap();

        assert_eq!(config.normalized_lines(), vec!["M1", "M2"]);
        assert!(!config.pairing.match_lot_no);
        assert_eq!(config.pairing.match_window_secs, 10);
        assert_eq!(config.lifecycle.closure_times().unwrap().len(), 2);
        assert_eq!(config.local.lock_retry.max_attempts, 3);
    }

    #[test]
    fn test_invalid_checkpoint_rejected() {
        let result = StationConfig::from_toml_str(
            r#"
            [lifecycle]
            closure_checkpoints = ["25:99"]
            "#,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_horizon_shorter_than_window_rejected() {
        let result = StationConfig::from_toml_str(
            r#"
            [pairing]
            match_window_secs = 60
            cleanup_horizon_secs = 30
            "#,
        );
        assert!(result.is_err());
    }
}
