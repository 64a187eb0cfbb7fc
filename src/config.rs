use crate::classify::{LineClassifier, DEFAULT_BANNER_PREFIX, DEFAULT_SUCCESS_MARKER};
use crate::monitor::MonitorConfig;
use crate::probe::ProbeCommand;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "last-ping.toml";

/// Top-level configuration loaded from last-ping.toml.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LastPingConfig {
    pub probe: ProbeConfig,
    pub output: OutputConfig,
    pub stats: StatsConfig,
    pub serve: ServeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub command: String,
    pub args: Vec<String>,
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub success_marker: String,
    pub banner_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Hold `<output>.lock` while watching.
    pub lock: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    pub sample_interval_secs: u64,
    pub diskstats_path: PathBuf,
    pub net_class_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServeConfig {
    pub bind: String,
    pub port: u16,
}

// --- Default implementations ---

impl Default for ProbeConfig {
    fn default() -> Self {
        let command = ProbeCommand::default();
        Self {
            command: command.program,
            args: command.args,
            timeout_secs: 60,
            interval_secs: 60,
            success_marker: DEFAULT_SUCCESS_MARKER.to_string(),
            banner_prefix: DEFAULT_BANNER_PREFIX.to_string(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self { lock: true }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval_secs: 1,
            diskstats_path: PathBuf::from("/proc/diskstats"),
            net_class_dir: PathBuf::from("/sys/class/net"),
        }
    }
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8425,
        }
    }
}

/// Errors loading or validating the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid { message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
            ConfigError::Invalid { message } => write!(f, "invalid config: {}", message),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}

impl LastPingConfig {
    /// Load from `path`. A missing file yields the defaults; a file that
    /// exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI overrides on top of the file values.
    pub fn apply_overrides(&mut self, timeout_secs: Option<u64>, interval_secs: Option<u64>) {
        if let Some(t) = timeout_secs {
            self.probe.timeout_secs = t;
        }
        if let Some(i) = interval_secs {
            self.probe.interval_secs = i;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.probe.command.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "probe.command is empty".to_string(),
            });
        }
        if self.probe.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "probe.interval_secs must be greater than 0".to_string(),
            });
        }
        if self.probe.success_marker.is_empty() {
            return Err(ConfigError::Invalid {
                message: "probe.success_marker is empty".to_string(),
            });
        }
        if self.stats.sample_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                message: "stats.sample_interval_secs must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Monitor settings for `host`.
    pub fn monitor_config(&self, host: &str) -> MonitorConfig {
        let probe = &self.probe;
        MonitorConfig::new(
            host,
            Duration::from_secs(probe.timeout_secs),
            Duration::from_secs(probe.interval_secs),
        )
        .with_command(ProbeCommand {
            program: probe.command.clone(),
            args: probe.args.clone(),
        })
        .with_classifier(LineClassifier::new(
            probe.success_marker.clone(),
            probe.banner_prefix.clone(),
        ))
    }
}
