use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::{NativePlatform, Platform};

pub const DEFAULT_API_PORT: u16 = 17900;

/// Daemon configuration, read from `<data_dir>/config.toml`.
/// Every field has a default so an empty or missing file is valid.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub api_token: Option<String>,
    pub default_working_dir: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub backend: BackendConfig,
    pub scheduler: SchedulerConfig,
    pub broadcast: BroadcastConfig,
    pub mailbox: MailboxConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub program: String,
    pub args: Vec<String>,
    pub resume_flag: Option<String>,
    pub max_turns_flag: Option<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub resurrection_stagger_secs: u64,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub ping_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    pub duplicate_window_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_API_PORT,
            api_token: None,
            default_working_dir: None,
            data_dir: NativePlatform::data_dir(),
            backend: BackendConfig::default(),
            scheduler: SchedulerConfig::default(),
            broadcast: BroadcastConfig::default(),
            mailbox: MailboxConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            args: vec![
                "-p".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            resume_flag: Some("--resume".to_string()),
            max_turns_flag: Some("--max-turns".to_string()),
            env: HashMap::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            resurrection_stagger_secs: 3,
            shutdown_timeout_secs: 10,
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            duplicate_window_secs: 5,
        }
    }
}

impl HubConfig {
    /// Load `config.toml` from `path`, or the data dir when `path` is `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let data_dir = NativePlatform::data_dir();
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| data_dir.join("config.toml"));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            Self::from_toml(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };
        if config.data_dir.as_os_str().is_empty() {
            config.data_dir = data_dir;
        }
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("agentbox.db")
    }

    pub fn working_dir(&self) -> PathBuf {
        self.default_working_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("workspace"))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler.poll_interval_secs.max(1))
    }

    pub fn resurrection_stagger(&self) -> Duration {
        Duration::from_secs(self.scheduler.resurrection_stagger_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.scheduler.shutdown_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast.ping_interval_secs.max(1))
    }

    pub fn duplicate_window(&self) -> Duration {
        Duration::from_secs(self.mailbox.duplicate_window_secs)
    }

    pub fn is_loopback(&self) -> bool {
        matches!(self.host.as_str(), "127.0.0.1" | "::1" | "localhost")
    }
}
