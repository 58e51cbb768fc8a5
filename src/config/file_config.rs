use crate::repository::RepositorySettings;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub mirror_dir: Option<String>,
    pub metrics_port: Option<u16>,
    pub identity: Option<String>,

    // Feature configs
    pub driver: Option<DriverFileConfig>,
    pub repositories: Vec<RepositorySettings>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DriverFileConfig {
    pub slots: Option<usize>,
    pub max_job_duration_secs: Option<u64>,
    pub lease_duration_secs: Option<u64>,
    pub lease_renewal_interval_secs: Option<u64>,
    pub poll_interval_secs: Option<u64>,
    pub cleanup_interval_secs: Option<u64>,
    /// 0 keeps history forever.
    pub history_expiration_secs: Option<u64>,
    /// 0 disables the abandoned job cleanup.
    pub max_attempts: Option<u32>,
    pub progress_interval_secs: Option<u64>,
    pub notification_capacity: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
