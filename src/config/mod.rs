//! Configuration management for mpgate.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection lifecycle.
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Static routing.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Packet workers.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Fatal error handling.
    #[serde(default)]
    pub shutdown: ShutdownConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config: {e}")))?;

        Self::parse(&content)
    }

    /// Parse and validate configuration text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| Error::Config(format!("Failed to write config: {e}")))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("Failed to serialize config: {e}")))
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        let connection = &self.connection;

        if connection.reclaim_interval.is_zero() {
            return Err(Error::InvalidConfig("reclaim_interval must be non-zero".into()));
        }

        if connection.idle_threshold < connection.reclaim_interval {
            return Err(Error::InvalidConfig(
                "idle_threshold must not be shorter than reclaim_interval".into(),
            ));
        }

        if connection.channel_capacity == 0 {
            return Err(Error::InvalidConfig("channel_capacity must be non-zero".into()));
        }

        if self.worker.workers_per_channel == 0 {
            return Err(Error::InvalidConfig("workers_per_channel must be non-zero".into()));
        }

        if !matches!(self.logging.format.as_str(), "text" | "json") {
            return Err(Error::InvalidConfig(format!(
                "Unknown log format '{}', expected text or json",
                self.logging.format
            )));
        }

        Ok(())
    }

    /// Get default config path.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("net", "mpgate", "mpgate").map_or_else(
            || PathBuf::from("mpgate.toml"),
            |dirs| dirs.config_dir().join("config.toml"),
        )
    }

    /// Create example configuration.
    pub fn example() -> Self {
        Self {
            routing: RoutingConfig {
                table_path: Some(PathBuf::from("/etc/mpgate/routes.json")),
            },
            ..Default::default()
        }
    }
}

/// Connection lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// How often idle connections are swept.
    #[serde(default = "default_reclaim_interval", with = "humantime_serde")]
    pub reclaim_interval: Duration,

    /// Connections without forwarded traffic for this long are reclaimed.
    #[serde(default = "default_idle_threshold", with = "humantime_serde")]
    pub idle_threshold: Duration,

    /// Wait before dialing the traffic endpoint of a client flow.
    #[serde(default = "default_traffic_establish_delay", with = "humantime_serde")]
    pub traffic_establish_delay: Duration,

    /// Capacity of each packet channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_reclaim_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_idle_threshold() -> Duration {
    Duration::from_secs(20)
}
fn default_traffic_establish_delay() -> Duration {
    Duration::from_secs(2)
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reclaim_interval: default_reclaim_interval(),
            idle_threshold: default_idle_threshold(),
            traffic_establish_delay: default_traffic_establish_delay(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Static routing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// JSON routing table loaded at startup.
    pub table_path: Option<PathBuf>,
}

/// Worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Tasks draining each packet channel.
    #[serde(default = "default_workers_per_channel")]
    pub workers_per_channel: usize,
}

fn default_workers_per_channel() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers_per_channel: default_workers_per_channel(),
        }
    }
}

/// Fatal error handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// Delay between a critical error and the shutdown broadcast.
    #[serde(default = "default_fatal_delay", with = "humantime_serde")]
    pub fatal_delay: Duration,

    /// Time allowed for a clean stop before the process is killed.
    #[serde(default = "default_grace_period", with = "humantime_serde")]
    pub grace_period: Duration,

    /// Exit the process when the grace period runs out.
    #[serde(default = "default_force_exit")]
    pub force_exit: bool,
}

fn default_fatal_delay() -> Duration {
    Duration::from_secs(1)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(5)
}
fn default_force_exit() -> bool {
    true
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            fatal_delay: default_fatal_delay(),
            grace_period: default_grace_period(),
            force_exit: default_force_exit(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text or json).
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log file path.
    pub file: Option<PathBuf>,

    /// Enable colored output.
    #[serde(default = "default_color")]
    pub color: bool,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}
fn default_color() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
            color: default_color(),
        }
    }
}

/// Initialize logging.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    use std::fs::OpenOptions;
    use std::sync::Arc;
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file = config
        .file
        .as_ref()
        .map(|path| OpenOptions::new().create(true).append(true).open(path))
        .transpose()
        .map_err(|e| Error::Config(format!("Failed to open log file: {e}")))?
        .map(Arc::new);

    let subscriber = tracing_subscriber::registry().with(filter);

    let result = match (config.format.as_str(), file) {
        ("json", Some(file)) => subscriber.with(fmt::layer().json().with_writer(file)).try_init(),
        ("json", None) => subscriber.with(fmt::layer().json()).try_init(),
        (_, Some(file)) => subscriber
            .with(fmt::layer().with_ansi(false).with_writer(file))
            .try_init(),
        (_, None) => subscriber.with(fmt::layer().with_ansi(config.color)).try_init(),
    };

    result.map_err(|e| Error::Config(format!("Failed to init logging: {e}")))
}
