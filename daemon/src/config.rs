use anyhow::Result;
use serde::{Deserialize, Serialize};
use shared::{get_config_path, AttributeMapping};
use std::fs;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub tree: TreeConfig,
    pub commit: CommitConfig,
    /// Explicit record attribute names; unset fields fall back to alias probing
    pub attributes: AttributeMapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Report name-only edits as changes
    pub track_names: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommitConfig {
    /// Skip the confirmation round-trip for structural changes
    pub auto_confirm: bool,
    /// Wait before reloading from the store after a successful commit
    pub refresh_delay_ms: u64,
    pub max_concurrent_resolutions: usize,
    /// Entity type passed to the store when creating records
    pub entity: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self { track_names: true }
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            auto_confirm: false,
            refresh_delay_ms: 1000,
            max_concurrent_resolutions: 8,
            entity: "Group".to_string(),
        }
    }
}

impl CommitConfig {
    pub fn refresh_delay(&self) -> Duration {
        Duration::from_millis(self.refresh_delay_ms)
    }
}

pub fn parse_config(content: &str) -> Result<Config> {
    Ok(toml::from_str(content)?)
}

pub fn load_config() -> Result<Config> {
    let config_path = get_config_path()?;
    if config_path.exists() {
        let content = fs::read_to_string(&config_path)?;
        parse_config(&content)
    } else {
        Ok(Config::default())
    }
}
