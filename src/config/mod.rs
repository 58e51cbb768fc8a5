mod file_config;

pub use file_config::{DriverFileConfig, FileConfig};

use crate::driver::{self, DriverConfig};
use crate::jobs::notifier::DEFAULT_SUBSCRIBER_CAPACITY;
use crate::repository::RepositorySettings;
use anyhow::{bail, Result};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub mirror_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub identity: Option<String>,
    pub slots: usize,
    pub max_job_duration_secs: u64,
    pub lease_duration_secs: u64,
    pub lease_renewal_interval_secs: u64,
    pub poll_interval_secs: u64,
    pub history_expiration_secs: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            mirror_dir: None,
            metrics_port: 0,
            identity: None,
            slots: driver::DEFAULT_SLOTS,
            max_job_duration_secs: driver::DEFAULT_MAX_JOB_DURATION.as_secs(),
            lease_duration_secs: driver::DEFAULT_LEASE_DURATION.as_secs(),
            lease_renewal_interval_secs: driver::DEFAULT_LEASE_RENEWAL_INTERVAL.as_secs(),
            poll_interval_secs: driver::DEFAULT_POLL_INTERVAL.as_secs(),
            history_expiration_secs: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    /// Root of the instance content the reference workers sync into.
    pub mirror_dir: PathBuf,
    /// `None` disables the metrics endpoint.
    pub metrics_port: Option<u16>,
    pub driver: DriverSettings,
    pub repositories: Vec<RepositorySettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    pub identity: Option<String>,
    pub slots: usize,
    pub max_job_duration: Duration,
    pub lease_duration: Duration,
    pub lease_renewal_interval: Duration,
    pub poll_interval: Duration,
    pub cleanup_interval: Duration,
    pub history_expiration: Duration,
    pub max_attempts: u32,
    pub progress_interval: Duration,
    pub notification_capacity: usize,
}

impl DriverSettings {
    pub fn to_driver_config(&self) -> DriverConfig {
        let defaults = DriverConfig::default();
        DriverConfig {
            identity: self.identity.clone().unwrap_or(defaults.identity),
            slots: self.slots,
            max_job_duration: self.max_job_duration,
            lease_duration: self.lease_duration,
            lease_renewal_interval: self.lease_renewal_interval,
            poll_interval: self.poll_interval,
            cleanup_interval: self.cleanup_interval,
            history_expiration: self.history_expiration,
            max_attempts: self.max_attempts,
            progress_interval: self.progress_interval,
            ..defaults
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let mirror_dir = file
            .mirror_dir
            .map(PathBuf::from)
            .or_else(|| cli.mirror_dir.clone())
            .unwrap_or_else(|| db_dir.join("mirror"));

        let metrics_port = Some(file.metrics_port.unwrap_or(cli.metrics_port)).filter(|p| *p != 0);

        let driver_file = file.driver.unwrap_or_default();
        let secs = Duration::from_secs;
        let driver = DriverSettings {
            identity: file.identity.or_else(|| cli.identity.clone()),
            slots: driver_file.slots.unwrap_or(cli.slots),
            max_job_duration: secs(
                driver_file
                    .max_job_duration_secs
                    .unwrap_or(cli.max_job_duration_secs),
            ),
            lease_duration: secs(
                driver_file
                    .lease_duration_secs
                    .unwrap_or(cli.lease_duration_secs),
            ),
            lease_renewal_interval: secs(
                driver_file
                    .lease_renewal_interval_secs
                    .unwrap_or(cli.lease_renewal_interval_secs),
            ),
            poll_interval: secs(
                driver_file
                    .poll_interval_secs
                    .unwrap_or(cli.poll_interval_secs),
            ),
            cleanup_interval: driver_file
                .cleanup_interval_secs
                .map(secs)
                .unwrap_or(driver::DEFAULT_CLEANUP_INTERVAL),
            history_expiration: secs(
                driver_file
                    .history_expiration_secs
                    .unwrap_or(cli.history_expiration_secs),
            ),
            max_attempts: driver_file
                .max_attempts
                .unwrap_or(driver::DEFAULT_MAX_ATTEMPTS),
            progress_interval: driver_file
                .progress_interval_secs
                .map(secs)
                .unwrap_or(crate::workers::DEFAULT_PROGRESS_INTERVAL),
            notification_capacity: driver_file
                .notification_capacity
                .unwrap_or(DEFAULT_SUBSCRIBER_CAPACITY),
        };

        if driver.slots == 0 {
            bail!("slots must be at least 1");
        }
        if driver.lease_renewal_interval >= driver.lease_duration {
            bail!(
                "Lease renewal interval ({:?}) must be shorter than the lease duration ({:?})",
                driver.lease_renewal_interval,
                driver.lease_duration
            );
        }
        if driver.poll_interval.is_zero() || driver.max_job_duration.is_zero() {
            bail!("poll interval and max job duration must be positive");
        }

        let mut seen = HashSet::new();
        for repo in &file.repositories {
            if !seen.insert((repo.namespace.as_str(), repo.name.as_str())) {
                bail!(
                    "Repository {}/{} is configured more than once",
                    repo.namespace,
                    repo.name
                );
            }
        }

        Ok(Self {
            db_dir,
            mirror_dir,
            metrics_port,
            driver,
            repositories: file.repositories,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }

    pub fn history_db_path(&self) -> PathBuf {
        self.db_dir.join("history.db")
    }
}
