//! Orchestrator configuration loaded from `.conveyor/conveyor.toml`.
//!
//! Every field has a default, so an empty or missing file is a valid
//! configuration. Environment variables override the file; CLI flags
//! override both (applied in `main`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const CONFIG_DIR: &str = ".conveyor";
pub const CONFIG_FILE: &str = "conveyor.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub provisioner: ProvisionerSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSection {
    /// Cluster id this controller instance is responsible for.
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_sync_interval", with = "humantime_serde")]
    pub sync_interval: Duration,
    #[serde(default = "default_resync_interval", with = "humantime_serde")]
    pub resync_interval: Duration,
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(default = "default_cert_check_interval", with = "humantime_serde")]
    pub cert_check_interval: Duration,
}

impl Default for ControllerSection {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            sync_interval: default_sync_interval(),
            resync_interval: default_resync_interval(),
            retry_backoff: default_retry_backoff(),
            cert_check_interval: default_cert_check_interval(),
        }
    }
}

fn default_cluster_name() -> String {
    "local".to_string()
}

fn default_sync_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_resync_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(2)
}

fn default_cert_check_interval() -> Duration {
    Duration::from_secs(3600)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionerSection {
    /// Inclusive `"<low>-<high>"` range the registry proxy ports come from.
    #[serde(default = "default_port_range")]
    pub port_range: String,
    #[serde(default = "default_attempts")]
    pub quota_settle_attempts: u32,
    #[serde(default = "default_quota_settle_interval", with = "humantime_serde")]
    pub quota_settle_interval: Duration,
    #[serde(default = "default_attempts")]
    pub secret_create_attempts: u32,
    /// Registry certificate lifetime used when the project setting is missing or invalid.
    #[serde(default = "default_signing_duration", with = "humantime_serde")]
    pub default_signing_duration: Duration,
}

impl Default for ProvisionerSection {
    fn default() -> Self {
        Self {
            port_range: default_port_range(),
            quota_settle_attempts: default_attempts(),
            quota_settle_interval: default_quota_settle_interval(),
            secret_create_attempts: default_attempts(),
            default_signing_duration: default_signing_duration(),
        }
    }
}

fn default_port_range() -> String {
    "34000-35000".to_string()
}

fn default_attempts() -> u32 {
    3
}

fn default_quota_settle_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_signing_duration() -> Duration {
    Duration::from_secs(8760 * 3600)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerSection {
    /// Public base URL used to build execution links in notifications.
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("conveyor.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Root directory for step workspaces and captured logs.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            workspace_dir: default_workspace_dir(),
        }
    }
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("workspace")
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSection {
    #[serde(default)]
    pub format: LogFormat,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conveyor.toml")
    }

    /// Load from `path`, or defaults when it doesn't exist, then apply
    /// environment overrides.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize conveyor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("CONVEYOR_SERVER_URL") {
            self.server.url = url;
        }
        if let Ok(name) = std::env::var("CONVEYOR_CLUSTER_NAME") {
            self.controller.cluster_name = name;
        }
        if let Ok(path) = std::env::var("CONVEYOR_DB_PATH") {
            self.store.db_path = PathBuf::from(path);
        }
    }
}

/// Default config file location relative to the working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join(CONFIG_FILE)
}

mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
