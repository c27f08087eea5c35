//! Error types for sidecar-master-core

use std::fmt::Write;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::dispatch::DispatchError;
pub use crate::loader::LoadError;
pub use crate::logging::LogError;
pub use crate::master::OperatorError;
pub use crate::recording::RecordingError;
pub use crate::status::StatusError;
pub use crate::tree::TreeError;

/// A command the operator can run to fix or diagnose an error
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    pub label: String,
    pub command: String,
}

/// Actionable guidance attached to an error
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    pub commands: Vec<RemediationCommand>,
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for terminal output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Configuration load error: {0}")]
    Load(#[from] LoadError),

    #[error("Status error: {0}")]
    Status(#[from] StatusError),

    #[error("Tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Recording error: {0}")]
    Recording(#[from] RecordingError),

    #[error("Logging error: {0}")]
    Log(#[from] LogError),

    #[error("{0}")]
    Operator(#[from] OperatorError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The core loop went away while a request was in flight.
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Config(err) => Some(config_remediation(err)),
            Self::Load(err) => Some(load_remediation(err)),
            Self::Recording(err) | Self::Operator(OperatorError::Recording(err)) => {
                recording_remediation(err)
            }
            Self::Operator(OperatorError::Load(err)) => Some(load_remediation(err)),
            Self::Dispatch(_) => Some(
                Remediation::new("Check that the runner is up and its command port is reachable.")
                    .command("Check configuration", "scm check <configuration.xml>")
                    .alternative("Raise [dispatch] call_timeout_ms for slow hosts."),
            ),
            Self::Log(LogError::InvalidLevel(_)) => Some(
                Remediation::new("Use one of trace, debug, info, warn, error.")
                    .alternative("Set RUST_LOG to override the configured level."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the recordings and logs directories exist and are writable."),
            ),
            Self::Status(_) | Self::Tree(_) | Self::Log(_) | Self::Operator(_) | Self::Runtime(_) => {
                None
            }
        }
    }
}

fn config_remediation(err: &ConfigError) -> Remediation {
    match err {
        ConfigError::Read { path, .. } => {
            Remediation::new(format!("Create or fix permissions on {}.", path.display()))
                .command("Show path", format!("ls -la \"{}\"", path.display()))
                .alternative("Run without --config to use the built-in defaults.")
        }
        ConfigError::Parse { .. } => Remediation::new("Fix the TOML syntax and retry.")
            .alternative("Remove the offending section to fall back to its defaults."),
        ConfigError::Invalid { field, .. } => {
            Remediation::new(format!("Correct the value of {field} in the config file."))
        }
    }
}

fn load_remediation(err: &LoadError) -> Remediation {
    match err {
        LoadError::FileOpen { path, .. } => {
            Remediation::new(format!("Check that {} exists and is readable.", path.display()))
                .command("Show file", format!("ls -la \"{}\"", path.display()))
        }
        LoadError::XmlParse { path, line, .. } => Remediation::new(format!(
            "Fix the XML near line {line} of {}.",
            path.display()
        ))
        .command("Validate", format!("xmllint --noout \"{}\"", path.display())),
        LoadError::NotLoaded => Remediation::new("Load a configuration file first.")
            .command("Check", "scm check <configuration.xml>"),
        _ => Remediation::new("Add the missing or invalid elements to the configuration file.")
            .command("Check", "scm check <configuration.xml>"),
    }
}

fn recording_remediation(err: &RecordingError) -> Option<Remediation> {
    match err {
        RecordingError::NoLoadedConfig => Some(
            Remediation::new("Start a configuration that has a writable recordings directory.")
                .alternative("Mark the configuration as recordable."),
        ),
        RecordingError::FailedCreateDirectory { path, .. }
        | RecordingError::FailedRecordingSetup { path, .. } => Some(
            Remediation::new(format!("Make {} writable by the master.", path.display()))
                .command("Show directory", format!("ls -la \"{}\"", path.display())),
        ),
        RecordingError::FailedPostRecordingStateChange => Some(
            Remediation::new("One or more runners did not accept the recording command.")
                .alternative("Check the runner logs and retry the recording."),
        ),
        RecordingError::AlreadyRecording => {
            Some(Remediation::new("Stop the active recording first."))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn remediation_available_for_operator_errors() {
        let errors = vec![
            Error::Config(ConfigError::Invalid {
                field: "dispatch.call_timeout_ms",
                reason: "zero".to_string(),
            }),
            Error::Load(LoadError::MissingRadar),
            Error::Load(LoadError::XmlParse {
                path: PathBuf::from("/etc/alpha.xml"),
                line: 3,
                column: 7,
            }),
            Error::Recording(RecordingError::NoLoadedConfig),
            Error::Recording(RecordingError::FailedCreateDirectory {
                path: PathBuf::from("/space1/recordings"),
                source: std::io::Error::other("denied"),
            }),
            Error::Io(std::io::Error::other("io")),
        ];
        for error in errors {
            let remediation = error.remediation().expect("missing remediation");
            assert!(!remediation.summary.is_empty(), "empty summary for {error}");
        }
    }

    #[test]
    fn runtime_errors_have_no_remediation() {
        assert!(Error::Runtime("closed".to_string()).remediation().is_none());
        assert!(
            Error::Recording(RecordingError::NotRecording)
                .remediation()
                .is_none()
        );
    }

    #[test]
    fn render_plain_lists_sections() {
        let text = Remediation::new("Do the thing.")
            .command("Check", "scm check a.xml")
            .alternative("Or not.")
            .render_plain();
        assert_eq!(
            text,
            "To fix:\n  Do the thing.\n  Commands:\n    - Check: scm check a.xml\n  Alternatives:\n    - Or not.\n"
        );
    }

    #[test]
    fn render_plain_skips_empty_sections() {
        let text = Remediation::new("Only summary.").render_plain();
        assert_eq!(text, "To fix:\n  Only summary.\n");
    }

    #[test]
    fn display_wraps_inner_message() {
        let err = Error::from(LoadError::MissingRadar);
        assert_eq!(err.to_string(), "Configuration load error: Missing <radar> element");
    }
}
