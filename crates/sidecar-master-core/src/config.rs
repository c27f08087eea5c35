//! Master configuration.
//!
//! Loaded from a TOML file. Every section is optional and falls back to its
//! defaults, so an empty file is a valid configuration.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::discovery::StaticService;
use crate::lifecycle::LifecycleTiming;
use crate::logging::LogConfig;

/// File name looked up under the platform config directory.
pub const CONFIG_FILE_NAME: &str = "scm.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// =============================================================================
// Log format
// =============================================================================

/// Output format for log lines on stderr and in the log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

// =============================================================================
// Sections
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub ingest: IngestConfig,
    pub remote_control: RemoteControlConfig,
    pub lifecycle: LifecycleConfig,
    pub recording: RecordingConfig,
    pub dispatch: DispatchConfig,
    pub disk_space: DiskSpaceConfig,
    pub cleanup: CleanupConfig,
    /// Statically known runner services.
    pub discovery: Vec<StaticService>,
    /// Configuration XML files loaded at startup.
    pub configurations: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

impl GeneralConfig {
    #[must_use]
    pub fn log_config(&self) -> LogConfig {
        LogConfig {
            level: self.log_level.clone(),
            format: self.log_format,
            file: self.log_file.clone(),
        }
    }
}

/// Inbound status datagrams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_status_bind")]
    pub status_bind: String,
    #[serde(default = "default_max_datagram_bytes")]
    pub max_datagram_bytes: usize,
    /// Drop status from runners discovery has never reported.
    #[serde(default = "default_true")]
    pub require_discovery: bool,
}

fn default_status_bind() -> String {
    "0.0.0.0:4500".to_string()
}

const fn default_max_datagram_bytes() -> usize {
    65_507
}

const fn default_true() -> bool {
    true
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            status_bind: default_status_bind(),
            max_datagram_bytes: default_max_datagram_bytes(),
            require_discovery: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteControlConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_remote_bind")]
    pub bind: String,
}

fn default_remote_bind() -> String {
    "127.0.0.1:4466".to_string()
}

impl Default for RemoteControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: default_remote_bind(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    #[serde(default = "default_partial_confirm_delay_ms")]
    pub partial_confirm_delay_ms: u64,
    #[serde(default = "default_presence_tick_ms")]
    pub presence_tick_ms: u64,
    /// Shut a configuration down without asking when it stays partial.
    #[serde(default)]
    pub auto_shutdown_on_loss: bool,
}

const fn default_startup_timeout_ms() -> u64 {
    30_000
}

const fn default_partial_confirm_delay_ms() -> u64 {
    1_000
}

const fn default_presence_tick_ms() -> u64 {
    100
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_ms: default_startup_timeout_ms(),
            partial_confirm_delay_ms: default_partial_confirm_delay_ms(),
            presence_tick_ms: default_presence_tick_ms(),
            auto_shutdown_on_loss: false,
        }
    }
}

impl LifecycleConfig {
    #[must_use]
    pub const fn timing(&self) -> LifecycleTiming {
        LifecycleTiming {
            startup_timeout: Duration::from_millis(self.startup_timeout_ms),
            partial_confirm_delay: Duration::from_millis(self.partial_confirm_delay_ms),
        }
    }

    #[must_use]
    pub const fn presence_tick(&self) -> Duration {
        Duration::from_millis(self.presence_tick_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Duration limit applied to new recordings; unlimited when unset.
    #[serde(default)]
    pub duration_secs: Option<u64>,
    #[serde(default = "default_initial_sequence")]
    pub initial_sequence: u32,
    /// Scanned by restore in addition to the configurations' own directories.
    #[serde(default)]
    pub recordings_roots: Vec<PathBuf>,
}

const fn default_initial_sequence() -> u32 {
    1
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            duration_secs: None,
            initial_sequence: default_initial_sequence(),
            recordings_roots: Vec::new(),
        }
    }
}

impl RecordingConfig {
    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

const fn default_connect_timeout_ms() -> u64 {
    2_000
}

const fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl DispatchConfig {
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskSpaceConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Usage percentage at which a warning is logged.
    #[serde(default = "default_warning_percent")]
    pub warning_percent: u8,
}

const fn default_poll_interval_secs() -> u64 {
    5
}

const fn default_warning_percent() -> u8 {
    90
}

impl Default for DiskSpaceConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            warning_percent: default_warning_percent(),
        }
    }
}

impl DiskSpaceConfig {
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Host cleanup. `command` is an argv template; `{host}` is replaced by the
/// host being cleaned. Cleanup only logs when no command is configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupConfig {
    #[serde(default)]
    pub command: Vec<String>,
}

// =============================================================================
// Loading
// =============================================================================

impl Config {
    /// Default config file location, `<config dir>/sidecar/scm.toml`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("sidecar").join(CONFIG_FILE_NAME))
    }

    /// Load from the default location, or defaults when there is no file.
    pub fn load() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("lifecycle.startup_timeout_ms", self.lifecycle.startup_timeout_ms),
            ("lifecycle.presence_tick_ms", self.lifecycle.presence_tick_ms),
            ("dispatch.connect_timeout_ms", self.dispatch.connect_timeout_ms),
            ("dispatch.call_timeout_ms", self.dispatch.call_timeout_ms),
            ("disk_space.poll_interval_secs", self.disk_space.poll_interval_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.recording.duration_secs == Some(0) {
            return Err(ConfigError::Invalid {
                field: "recording.duration_secs",
                reason: "must be greater than zero when set".to_string(),
            });
        }
        if self.disk_space.warning_percent > 100 {
            return Err(ConfigError::Invalid {
                field: "disk_space.warning_percent",
                reason: format!("{} is above 100", self.disk_space.warning_percent),
            });
        }
        check_bind("ingest.status_bind", &self.ingest.status_bind)?;
        if self.remote_control.enabled {
            check_bind("remote_control.bind", &self.remote_control.bind)?;
        }
        if self.ingest.max_datagram_bytes == 0 {
            return Err(ConfigError::Invalid {
                field: "ingest.max_datagram_bytes",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

fn check_bind(field: &'static str, value: &str) -> Result<(), ConfigError> {
    value
        .parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|err| ConfigError::Invalid {
            field,
            reason: format!("'{value}': {err}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().expect("default config validates");
    }

    #[test]
    fn empty_toml_gives_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config, Config::default());
        assert_eq!(config.lifecycle.startup_timeout_ms, 30_000);
        assert_eq!(config.lifecycle.partial_confirm_delay_ms, 1_000);
        assert_eq!(config.lifecycle.presence_tick_ms, 100);
        assert_eq!(config.ingest.status_bind, "0.0.0.0:4500");
        assert_eq!(config.remote_control.bind, "127.0.0.1:4466");
        assert!(config.ingest.require_discovery);
        assert_eq!(config.recording.initial_sequence, 1);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config: Config = toml::from_str(
            r#"
configurations = ["/etc/sidecar/alpha.xml"]

[general]
log_format = "json"

[recording]
duration_secs = 600

[[discovery]]
service = "alpha:node1:Runner 1"
host = "node1"
port = 9000
"#,
        )
        .expect("parse");
        assert_eq!(config.general.log_format, LogFormat::Json);
        assert_eq!(config.general.log_level, "info");
        assert_eq!(
            config.recording.duration_limit(),
            Some(Duration::from_secs(600))
        );
        assert_eq!(config.recording.initial_sequence, 1);
        assert_eq!(config.discovery.len(), 1);
        assert_eq!(config.configurations.len(), 1);
        config.validate().expect("valid");
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = Config::default();
        config.dispatch.call_timeout_ms = 0;
        let err = config.validate().expect_err("zero timeout");
        assert!(err.to_string().contains("dispatch.call_timeout_ms"));
    }

    #[test]
    fn bad_bind_is_rejected() {
        let mut config = Config::default();
        config.remote_control.bind = "localhost".to_string();
        assert!(config.validate().is_err());
        config.remote_control.enabled = false;
        config.validate().expect("disabled server is not checked");
    }

    #[test]
    fn load_from_reports_parse_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("scm.toml");
        std::fs::write(&path, "[lifecycle]\nstartup_timeout_ms = \"soon\"\n").expect("write");
        let err = Config::load_from(&path).expect_err("bad type");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn load_from_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = Config::load_from(&dir.path().join("absent.toml")).expect_err("missing");
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn timing_converts_milliseconds() {
        let lifecycle = LifecycleConfig {
            startup_timeout_ms: 1_500,
            ..LifecycleConfig::default()
        };
        let timing = lifecycle.timing();
        assert_eq!(timing.startup_timeout, Duration::from_millis(1_500));
        assert_eq!(timing.partial_confirm_delay, Duration::from_secs(1));
    }

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>(), Ok(LogFormat::Json));
        assert_eq!("pretty".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
