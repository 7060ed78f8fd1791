//! Configuration file management for fleetd.
//!
//! Handles loading the daemon's configuration from `~/.config/fleetd/config.toml`
//! (or a path given via `--config`), and centralizes every timing constant the
//! background loops use.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How often the reconciler wakes to process one batch of printers (§4.5).
pub const STATUS_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
/// Number of printers processed per reconciler tick.
pub const RECONCILE_BATCH_SIZE: usize = 5;
/// Concurrency cap for the order distributor's sub-batches (§4.7).
pub const MAX_CONCURRENT_JOBS: usize = 5;
/// Sleep between distributor sub-batches.
pub const DISTRIBUTOR_BATCH_DELAY: Duration = Duration::from_secs(1);
/// Vendor-B ejection safety timeout (§4.6.3).
pub const EJECTION_SAFETY_TIMEOUT: Duration = Duration::from_secs(15);
/// Minimum spacing between two ejection sends to the same printer, absent `force`.
pub const EJECTION_COOLDOWN: Duration = Duration::from_secs(10);
/// `manual_timeout` grace period applied after ejection completion (§9 open question:
/// this implementation chooses the "strict" reading — the timeout is honored).
pub const MANUAL_TIMEOUT: Duration = Duration::from_secs(300);
/// How often the store re-asserts printer/order uniqueness (§4.1).
pub const DEDUP_INTERVAL: Duration = Duration::from_secs(300);
/// How often Vendor-B sessions are checked for staleness (§4.4).
pub const CONNECTION_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);
/// A Vendor-B session with no message in this long is considered stale.
pub const CONNECTION_STALE_AFTER: Duration = Duration::from_secs(60);
/// Vendor-A independent ejection watchdog poll period (§4.6.3).
pub const VENDOR_A_WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);
/// Lock acquisition timeouts (§5).
pub const READ_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
pub const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(15);
pub const SAFE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
/// Per-call HTTP timeout for Vendor A (§4.3).
pub const HTTP_CALL_TIMEOUT: Duration = Duration::from_secs(15);
/// Delay before the distributor's best-effort Vendor-A start verification (§4.7.1).
pub const START_PRINT_VERIFY_DELAY: Duration = Duration::from_secs(20);

/// Daemon configuration stored in `~/.config/fleetd/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Directory holding `printers.json`, `orders.json`, `total_filament.json`,
    /// `ejection_codes.json` and `secret.key`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory G-code/3mf artifacts are read from when staging uploads.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: default_data_dir(),
            upload_dir: default_upload_dir(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("fleetd")
}

fn default_upload_dir() -> PathBuf {
    default_data_dir().join("uploads")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).with_context(|| "Failed to serialize config")?;

        fs::write(path, content).with_context(|| format!("Failed to write config file: {:?}", path))?;

        Ok(())
    }

    /// Returns the default config path (`~/.config/fleetd/config.toml`).
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::config_dir().context("Could not determine config directory")?;
        Ok(home.join("fleetd").join("config.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_file_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.data_dir, default_data_dir());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let cfg = Config {
            data_dir: dir.path().join("data"),
            upload_dir: dir.path().join("uploads"),
        };
        cfg.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.data_dir, cfg.data_dir);
        assert_eq!(loaded.upload_dir, cfg.upload_dir);
    }
}
