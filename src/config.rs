use crate::xferlog::DateOrder;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How handled log lines are remembered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ModeName {
    /// Side file of handled lines.
    #[default]
    ProcessedSet,
    /// Remove handled lines from the log.
    InPlace,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub watch: WatchConfig,
    pub dispatch: DispatchConfig,
    pub metrics: MetricsConfig,
    pub loki: LokiConfig,
    pub jobs: JobsConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatchConfig {
    /// The gateway's transaction log.
    pub log_path: PathBuf,
    pub spool_dir: PathBuf,
    /// Where `processed_faxes.log` and `last_run.txt` live.
    pub state_dir: PathBuf,
    pub mode: ModeName,
    pub date_order: DateOrder,
    pub poll_interval_secs: u64,
    pub debounce_ms: u64,
    pub quiet_window_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("/var/log/gofaxip/xferfaxlog"),
            spool_dir: PathBuf::from("/var/spool/hylafax"),
            state_dir: PathBuf::from("./log"),
            mode: ModeName::default(),
            date_order: DateOrder::default(),
            poll_interval_secs: 10,
            debounce_ms: 100,
            quiet_window_ms: 500,
        }
    }
}

impl WatchConfig {
    pub fn processed_path(&self) -> PathBuf {
        self.state_dir.join("processed_faxes.log")
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    /// When false, successful receives are only logged.
    pub enabled: bool,
    pub program: String,
    pub settle_delay_secs: u64,
    pub delete_after_send: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            program: "sendfax".to_string(),
            settle_delay_secs: 2,
            delete_after_send: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub addr: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: "0.0.0.0:9100".to_string(),
        }
    }
}

/// Loki shipping is off unless `url` is set.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LokiConfig {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobsConfig {
    /// systemd unit of the queue manager.
    pub unit: String,
    pub interval_secs: u64,
    pub lookback_secs: u64,
    pub reasons: Vec<String>,
    /// TIFF to PDF converter for previews. Empty disables previews.
    pub preview_program: String,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            unit: "faxq".to_string(),
            interval_secs: 120,
            lookback_secs: 600,
            reasons: vec![
                "rejected".to_string(),
                "removed".to_string(),
                "killed".to_string(),
            ],
            preview_program: "tiff2pdf".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebhookConfig {
    pub url: Option<String>,
    pub username: String,
    pub password: String,
}

impl Config {
    /// Load configuration.
    ///
    /// - `explicit` given: that file must exist and parse
    /// - otherwise ~/.config/faxrelay/config.toml if it exists
    /// - otherwise built-in defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Checks for `watch`. Creates the state directory.
    pub fn validate_watch(&self) -> Result<()> {
        let watch = &self.watch;
        if watch.poll_interval_secs == 0 {
            anyhow::bail!("watch.poll_interval_secs must be greater than zero");
        }
        if !watch.spool_dir.is_dir() {
            anyhow::bail!("Spool directory does not exist: {}", watch.spool_dir.display());
        }
        let log_dir = watch
            .log_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        if !log_dir.is_dir() {
            anyhow::bail!("Log directory does not exist: {}", log_dir.display());
        }
        self.ensure_state_dir()
    }

    /// Checks for `jobs`. Creates the state directory.
    pub fn validate_jobs(&self) -> Result<()> {
        if self.jobs.interval_secs == 0 {
            anyhow::bail!("jobs.interval_secs must be greater than zero");
        }
        if self.webhook.url.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("webhook.url is required for the jobs poller");
        }
        if !self.watch.spool_dir.is_dir() {
            anyhow::bail!(
                "Spool directory does not exist: {}",
                self.watch.spool_dir.display()
            );
        }
        self.ensure_state_dir()
    }

    fn ensure_state_dir(&self) -> Result<()> {
        let dir = &self.watch.state_dir;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory: {}", dir.display()))
    }

    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("faxrelay").join("config.toml"))
    }
}
