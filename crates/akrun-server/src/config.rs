use std::path::{Path, PathBuf};
use std::time::Duration;

use akrun_protocol::paths;
use anyhow::Context;
use libakrun::recurrence::StartWindow;
use libakrun::{AppConfig, DaemonSettings, Registry, ResourceConfig, RetryPolicy, SessionTimeouts};
use serde::Deserialize;

#[derive(Deserialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "paths::default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "paths::pid_file_path")]
    pub pid_file: PathBuf,
    /// Root of the active task directories.
    #[serde(default = "paths::active_tasks_dir")]
    pub data_dir: PathBuf,
    /// Root finished task directories are moved to.
    #[serde(default = "paths::completed_tasks_dir")]
    pub completed_dir: PathBuf,
    #[serde(default = "paths::db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_loop_period_secs")]
    pub loop_period_secs: f64,
    #[serde(default = "default_lock_max_wait_secs")]
    pub lock_max_wait_secs: u64,
    #[serde(default = "default_control_timeout_secs")]
    pub control_timeout_secs: u64,
    #[serde(default = "default_job_poll_secs")]
    pub job_poll_secs: u64,
    #[serde(default = "default_window_start")]
    pub window_start: String,
    #[serde(default = "default_window_end")]
    pub window_end: String,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub session: SessionTimeouts,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceConfig>,
    #[serde(default, rename = "app")]
    pub apps: Vec<AppConfig>,
}

impl ServerConfig {
    /// Load `path`, or the default config file when present, or built-in defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (paths::config_path(), false),
        };
        if !path.exists() {
            if required {
                anyhow::bail!("config file {} does not exist", path.display());
            }
            return Self::parse("");
        }
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(contents: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(contents)?;
        if config.loop_period_secs.is_nan() || config.loop_period_secs <= 0.0 {
            anyhow::bail!("loop_period_secs must be positive");
        }
        Ok(config)
    }

    pub fn registry(&self) -> anyhow::Result<Registry> {
        Ok(Registry::new(self.resources.clone(), self.apps.clone())?)
    }

    pub fn daemon_settings(&self) -> anyhow::Result<DaemonSettings> {
        let default_window = StartWindow::parse(&self.window_start, &self.window_end)
            .context("invalid default start window")?;
        Ok(DaemonSettings {
            loop_period: Duration::from_secs_f64(self.loop_period_secs),
            lock_max_wait: Duration::from_secs(self.lock_max_wait_secs),
            job_poll_interval: Duration::from_secs(self.job_poll_secs),
            default_window,
            retry: self.retry.clone(),
            timeouts: self.session.clone(),
        })
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

fn default_loop_period_secs() -> f64 {
    5.0
}

fn default_lock_max_wait_secs() -> u64 {
    600
}

fn default_control_timeout_secs() -> u64 {
    30
}

fn default_job_poll_secs() -> u64 {
    60
}

fn default_window_start() -> String {
    "00:00".to_string()
}

fn default_window_end() -> String {
    "23:59".to_string()
}
