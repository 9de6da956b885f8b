//! Deployment configuration, loaded from `~/.vigil/config.toml`.
//!
//! Every section has serde defaults so a missing or partial file still
//! yields a runnable configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O: {0}")]
    Io(String),
    #[error("config parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub artifact: ArtifactConfig,
}

/// Timer periods for the supervision loops. These double as the retry
/// periods: a failed heartbeat write or partner spawn is simply retried on
/// the next tick, so there is deliberately no backoff policy here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Primary sweep interval (patrol role).
    pub sweep_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Patrol's check of the warden. Must exceed worst-case spawn+register
    /// latency so a slow-starting partner is not spawned twice.
    pub patrol_partner_check_secs: u64,
    /// Warden's check of the patrol.
    pub warden_partner_check_secs: u64,
    pub integrity_check_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 600,
            heartbeat_interval_secs: 30,
            patrol_partner_check_secs: 60,
            warden_partner_check_secs: 30,
            integrity_check_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    pub stop_grace_secs: u64,
    pub health_timeout_secs: u64,
    pub health_poll_millis: u64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            stop_grace_secs: 2,
            health_timeout_secs: 10,
            health_poll_millis: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Registry, secrets, key file, and manifest all live here.
    pub data_dir: PathBuf,
    /// Where the binary is installed (and where spawns self-exec from).
    pub install_path: PathBuf,
    /// Backup locations, chosen for directory diversity so a selective wipe
    /// of one tree leaves the others intact.
    pub backup_dirs: Vec<PathBuf>,
    /// Service-manager unit recorded in the backup manifest.
    pub service_unit_path: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            data_dir: home.join(".vigil"),
            install_path: home.join(".local").join("bin").join("vigil"),
            backup_dirs: vec![
                home.join(".config").join(".vigil-cache"),
                home.join(".local").join("share").join(".vigil-cache"),
                PathBuf::from("/var/tmp").join(".vigil-cache"),
            ],
            service_unit_path: home
                .join(".config")
                .join("systemd")
                .join("user")
                .join("vigil.service"),
        }
    }
}

impl PathsConfig {
    pub fn manifest_file(&self) -> PathBuf {
        self.data_dir.join("manifest.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArtifactConfig {
    pub github_owner: String,
    pub github_repo: String,
}

impl Default for ArtifactConfig {
    fn default() -> Self {
        Self {
            github_owner: "vigil-sh".into(),
            github_repo: "vigil".into(),
        }
    }
}

impl Config {
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".vigil")
            .join("config.toml")
    }

    /// Load from the default path, falling back to defaults when the file
    /// does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("daemon.sweep_interval_secs", self.daemon.sweep_interval_secs),
            (
                "daemon.heartbeat_interval_secs",
                self.daemon.heartbeat_interval_secs,
            ),
            (
                "daemon.patrol_partner_check_secs",
                self.daemon.patrol_partner_check_secs,
            ),
            (
                "daemon.warden_partner_check_secs",
                self.daemon.warden_partner_check_secs,
            ),
            (
                "daemon.integrity_check_secs",
                self.daemon.integrity_check_secs,
            ),
            ("update.health_timeout_secs", self.update.health_timeout_secs),
            ("update.health_poll_millis", self.update.health_poll_millis),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        if self.paths.backup_dirs.is_empty() {
            return Err(ConfigError::Invalid(
                "paths.backup_dirs must not be empty".into(),
            ));
        }
        if self.artifact.github_owner.is_empty() || self.artifact.github_repo.is_empty() {
            return Err(ConfigError::Invalid(
                "artifact.github_owner and artifact.github_repo are required".into(),
            ));
        }
        Ok(())
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.update.stop_grace_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.update.health_timeout_secs)
    }

    pub fn health_poll(&self) -> Duration {
        Duration::from_millis(self.update.health_poll_millis)
    }
}
