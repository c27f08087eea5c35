//! Inbound runner status records.
//!
//! Each runner periodically publishes one [`RunnerStatus`] describing every
//! stream and task it hosts. Records are self-describing JSON documents with a
//! `version` tag; anything not carrying [`STATUS_VERSION`] is rejected before
//! the rest of the payload is looked at.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::processing_state::ProcessingState;

/// Status record layout version understood by this build.
pub const STATUS_VERSION: u32 = 3;

/// Runner memory usage above which the runner is flagged.
pub const MEMORY_WARNING_BYTES: u64 = 500 * 1024 * 1024;
/// Runner memory usage above which the runner is flagged as critical.
pub const MEMORY_DANGER_BYTES: u64 = 1024 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status record is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("status record version {found} does not match expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("invalid service name '{0}': expected <configuration>:<host>:<runner>")]
    InvalidServiceName(String),
}

// =============================================================================
// Runner identity
// =============================================================================

/// Structured identity of a runner: which configuration it belongs to, which
/// host it runs on, and its name within the configuration.
///
/// The published service name is the `:`-joined rendering of these parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunnerId {
    pub configuration: String,
    pub host: String,
    pub runner: String,
}

impl RunnerId {
    #[must_use]
    pub fn new(
        configuration: impl Into<String>,
        host: impl Into<String>,
        runner: impl Into<String>,
    ) -> Self {
        Self {
            configuration: configuration.into(),
            host: host.into(),
            runner: runner.into(),
        }
    }

    /// Published service name, `configuration:host:runner`.
    #[must_use]
    pub fn service_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.configuration, self.host, self.runner)
    }
}

impl FromStr for RunnerId {
    type Err = StatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(configuration), Some(host), Some(runner))
                if !configuration.is_empty() && !host.is_empty() && !runner.is_empty() =>
            {
                Ok(Self::new(configuration, host, runner))
            }
            _ => Err(StatusError::InvalidServiceName(s.to_string())),
        }
    }
}

// =============================================================================
// Wire records
// =============================================================================

/// Status of one pipeline task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TaskStatus {
    pub name: String,
    pub processing_state: ProcessingState,
    /// Last error reported by the task; empty when healthy.
    pub error: String,
    /// Running count of messages the task has consumed.
    pub message_count: u64,
    pub using_data: bool,
    pub pending_queue: u64,
    pub drop_count: u64,
    pub dupe_count: u64,
}

/// Status of a controller task, which wraps a processing algorithm and may
/// record its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub task: TaskStatus,
    /// Class name of the wrapped algorithm.
    pub algorithm_name: String,
    pub has_parameters: bool,
    pub recording_enabled: bool,
    pub recording_on: bool,
    pub recording_queue: u64,
    pub average_processing_time: f64,
    pub min_processing_time: f64,
    pub max_processing_time: f64,
}

/// One entry of a stream's task list, tagged by its `class`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum TaskRecord {
    Task(TaskStatus),
    Controller(ControllerStatus),
}

impl TaskRecord {
    /// Fields common to both task kinds.
    #[must_use]
    pub const fn task(&self) -> &TaskStatus {
        match self {
            Self::Task(task) => task,
            Self::Controller(controller) => &controller.task,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.task().name
    }

    #[must_use]
    pub const fn is_controller(&self) -> bool {
        matches!(self, Self::Controller(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct StreamStatus {
    pub name: String,
    pub tasks: Vec<TaskRecord>,
}

/// Complete status report from one runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerStatus {
    pub version: u32,
    pub name: String,
    pub config_name: String,
    pub service_name: String,
    pub host_name: String,
    #[serde(default)]
    pub log_path: String,
    #[serde(default)]
    pub streams: Vec<StreamStatus>,
    /// Log lines emitted since the previous report.
    #[serde(default)]
    pub log_messages: Vec<String>,
    /// Resident memory in bytes.
    #[serde(default)]
    pub memory_used: u64,
}

impl RunnerStatus {
    /// Structured identity parsed from the published service name.
    pub fn runner_id(&self) -> Result<RunnerId, StatusError> {
        self.service_name.parse()
    }

    #[must_use]
    pub const fn memory_level(&self) -> MemoryLevel {
        MemoryLevel::classify(self.memory_used)
    }
}

/// Memory usage band of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLevel {
    Normal,
    Warning,
    Danger,
}

impl MemoryLevel {
    #[must_use]
    pub const fn classify(bytes: u64) -> Self {
        if bytes >= MEMORY_DANGER_BYTES {
            Self::Danger
        } else if bytes >= MEMORY_WARNING_BYTES {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u32,
}

/// Decode a status record, rejecting records from a different layout version.
pub fn decode_status(bytes: &[u8]) -> Result<RunnerStatus, StatusError> {
    let header: VersionHeader = serde_json::from_slice(bytes)?;
    if header.version != STATUS_VERSION {
        return Err(StatusError::VersionMismatch {
            found: header.version,
            expected: STATUS_VERSION,
        });
    }
    Ok(serde_json::from_slice(bytes)?)
}
