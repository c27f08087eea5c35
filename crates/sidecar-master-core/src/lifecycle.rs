//! Per-configuration lifecycle: load, startup, runner presence, partial loss.
//!
//! A [`ConfigurationEntry`] tracks which of its expected runners are currently
//! reporting. Its status is derived from that presence alone:
//!
//! | presence | startup deadline armed | status |
//! |----------|------------------------|--------|
//! | 0 | no | `NotRunning` |
//! | 0 | yes | `Starting` |
//! | 0 < n < expected | any | `Partial` |
//! | expected | any | `Running` |
//!
//! `Error` is held while the file has not loaded. Recording is an overlay on
//! top of the derived status.
//!
//! Time never comes from a clock in here: callers pass `now` in, and the master
//! loop drives [`ConfigurationEntry::poll`] from its 100 ms tick.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::launcher::{LaunchCompletion, LaunchOutcome, Launcher};
use crate::loader::{LoadError, LoadedConfiguration, configuration_name, load_configuration};
use crate::status::RunnerId;

/// Lifecycle timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTiming {
    /// How long a startup may take before missing runners are reported.
    pub startup_timeout: Duration,
    /// How long a running configuration must stay partial before the loss is
    /// reported.
    pub partial_confirm_delay: Duration,
}

impl Default for LifecycleTiming {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            partial_confirm_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Error,
    NotRunning,
    Starting,
    Partial,
    Running,
}

impl LifecycleStatus {
    /// Pure status derivation from runner presence.
    #[must_use]
    pub const fn derive(presence: usize, expected: usize, starting: bool) -> Self {
        if presence == 0 {
            if starting { Self::Starting } else { Self::NotRunning }
        } else if presence < expected {
            Self::Partial
        } else {
            Self::Running
        }
    }

    #[must_use]
    pub const fn is_running(self) -> bool {
        matches!(self, Self::Partial | Self::Running)
    }
}

impl std::fmt::Display for LifecycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::NotRunning => write!(f, "not_running"),
            Self::Starting => write!(f, "starting"),
            Self::Partial => write!(f, "partial"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Things the operator should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    StatusChanged {
        configuration: String,
        from: LifecycleStatus,
        to: LifecycleStatus,
        recording: bool,
    },
    LoadFailed {
        configuration: String,
        reason: String,
    },
    RecordingDirectoryUnusable {
        configuration: String,
        directory: PathBuf,
        reason: String,
    },
    LaunchSucceeded {
        configuration: String,
    },
    /// The startup deadline passed with runners still missing.
    LaunchFailed {
        configuration: String,
        missing: Vec<String>,
        hosts: Vec<String>,
        none_reported: bool,
    },
    /// A running configuration stayed partial; forced shutdown is offered.
    RunnersLost {
        configuration: String,
        missing: Vec<String>,
        hosts: Vec<String>,
    },
}

impl LifecycleEvent {
    #[must_use]
    pub fn configuration(&self) -> &str {
        match self {
            Self::StatusChanged { configuration, .. }
            | Self::LoadFailed { configuration, .. }
            | Self::RecordingDirectoryUnusable { configuration, .. }
            | Self::LaunchSucceeded { configuration }
            | Self::LaunchFailed { configuration, .. }
            | Self::RunnersLost { configuration, .. } => configuration,
        }
    }

    /// Status-bar text for this event, if it warrants one.
    #[must_use]
    pub fn status_message(&self) -> Option<String> {
        match self {
            Self::StatusChanged {
                configuration,
                from,
                to: LifecycleStatus::NotRunning,
                ..
            } if *from != LifecycleStatus::Error => Some(format!("{configuration} shut down.")),
            Self::StatusChanged {
                configuration,
                to: LifecycleStatus::Running,
                ..
            } => Some(format!("{configuration} running.")),
            Self::LoadFailed { reason, .. } => Some(reason.clone()),
            Self::LaunchSucceeded { configuration } => {
                Some(format!("Successfully launched all remote processes for {configuration}"))
            }
            Self::LaunchFailed {
                configuration,
                missing,
                ..
            } => Some(format!(
                "Failed to receive status reports from {} remote process{} for {configuration}",
                missing.len(),
                if missing.len() == 1 { "" } else { "es" }
            )),
            Self::RunnersLost {
                configuration,
                missing,
                ..
            } => Some(format!(
                "Lost status from {} remote process{} of {configuration}",
                missing.len(),
                if missing.len() == 1 { "" } else { "es" }
            )),
            _ => None,
        }
    }

    /// Whether this event also warrants a modal alert naming hosts.
    #[must_use]
    pub const fn is_alert(&self) -> bool {
        matches!(
            self,
            Self::LoadFailed { .. } | Self::LaunchFailed { .. } | Self::RunnersLost { .. }
        )
    }
}

/// Capacity of the filesystem holding a recordings directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskUsage {
    pub root: PathBuf,
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub percent_used: f64,
    /// Human-readable free space.
    pub free_text: String,
}

// =============================================================================
// Configuration entry
// =============================================================================

#[derive(Debug)]
pub struct ConfigurationEntry {
    path: PathBuf,
    name: String,
    timing: LifecycleTiming,
    loaded: Option<LoadedConfiguration>,
    error: Option<LoadError>,
    status: LifecycleStatus,
    presence: Vec<bool>,
    presence_count: usize,
    startup_deadline: Option<Instant>,
    partial_confirm_at: Option<Instant>,
    recording: bool,
    shutting_down: bool,
    started: bool,
    recordable: bool,
    viewable: bool,
    disk_usage: Option<DiskUsage>,
    events: Vec<LifecycleEvent>,
}

impl ConfigurationEntry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, timing: LifecycleTiming) -> Self {
        let path = path.into();
        Self {
            name: configuration_name(&path),
            path,
            timing,
            loaded: None,
            error: Some(LoadError::NotLoaded),
            status: LifecycleStatus::Error,
            presence: Vec::new(),
            presence_count: 0,
            startup_deadline: None,
            partial_confirm_at: None,
            recording: false,
            shutting_down: false,
            started: false,
            recordable: true,
            viewable: true,
            disk_usage: None,
            events: Vec::new(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn loaded(&self) -> Option<&LoadedConfiguration> {
        self.loaded.as_ref()
    }

    #[must_use]
    pub const fn error(&self) -> Option<&LoadError> {
        self.error.as_ref()
    }

    #[must_use]
    pub const fn status(&self) -> LifecycleStatus {
        self.status
    }

    #[must_use]
    pub const fn presence_count(&self) -> usize {
        self.presence_count
    }

    #[must_use]
    pub fn expected_count(&self) -> usize {
        self.presence.len()
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.recording
    }

    #[must_use]
    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    #[must_use]
    pub const fn is_starting(&self) -> bool {
        self.startup_deadline.is_some()
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.status.is_running()
    }

    #[must_use]
    pub const fn is_recordable(&self) -> bool {
        self.recordable
    }

    pub fn set_recordable(&mut self, recordable: bool) {
        self.recordable = recordable;
    }

    #[must_use]
    pub const fn is_viewable(&self) -> bool {
        self.viewable
    }

    pub fn set_viewable(&mut self, viewable: bool) {
        self.viewable = viewable;
    }

    #[must_use]
    pub const fn disk_usage(&self) -> Option<&DiskUsage> {
        self.disk_usage.as_ref()
    }

    /// Store a disk-usage sample. Returns whether it differs from the last one.
    pub fn set_disk_usage(&mut self, usage: DiskUsage) -> bool {
        let changed = self.disk_usage.as_ref() != Some(&usage);
        self.disk_usage = Some(usage);
        changed
    }

    #[must_use]
    pub fn recordings_directory(&self) -> Option<&Path> {
        self.loaded.as_ref().map(|l| l.recordings_directory.as_path())
    }

    /// Recordings directory exists and is writable.
    #[must_use]
    pub fn has_valid_recording_directory(&self) -> bool {
        self.recordings_directory()
            .is_some_and(|dir| recording_directory_problem(dir).is_none())
    }

    #[must_use]
    pub fn can_record(&self) -> bool {
        self.recordable && self.has_valid_recording_directory()
    }

    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        std::mem::take(&mut self.events)
    }

    /// Short status column text.
    #[must_use]
    pub fn status_text(&self) -> String {
        let mut text = match self.status {
            LifecycleStatus::Error => "*ERR*".to_string(),
            LifecycleStatus::NotRunning | LifecycleStatus::Starting => " ".to_string(),
            LifecycleStatus::Partial => {
                let mut text = format!("{} of {}", self.presence_count, self.presence.len());
                if self.recording {
                    text.push('*');
                }
                text
            }
            LifecycleStatus::Running if self.recording => "REC".to_string(),
            LifecycleStatus::Running => "ON".to_string(),
        };
        if self.shutting_down {
            text.push('-');
        }
        if self.startup_deadline.is_some() {
            text.push('+');
        }
        text
    }

    fn set_status(&mut self, status: LifecycleStatus) {
        if status == LifecycleStatus::NotRunning {
            self.started = false;
            self.shutting_down = false;
        }
        if status != self.status {
            tracing::info!(
                configuration = %self.name,
                from = %self.status,
                to = %status,
                "configuration status changed"
            );
            self.events.push(LifecycleEvent::StatusChanged {
                configuration: self.name.clone(),
                from: self.status,
                to: status,
                recording: self.recording,
            });
            self.status = status;
        }
    }

    fn derived_status(&self) -> LifecycleStatus {
        if self.loaded.is_none() {
            return LifecycleStatus::Error;
        }
        LifecycleStatus::derive(
            self.presence_count,
            self.presence.len(),
            self.startup_deadline.is_some(),
        )
    }

    // -------------------------------------------------------------------------
    // Load / startup
    // -------------------------------------------------------------------------

    /// (Re)load the configuration file. Failure parks the entry in `Error`
    /// until the next explicit load.
    pub fn load(&mut self) -> Result<(), LoadError> {
        self.loaded = None;
        self.presence.clear();
        self.presence_count = 0;
        self.startup_deadline = None;
        self.partial_confirm_at = None;

        match load_configuration(&self.path) {
            Err(err) => {
                tracing::error!(configuration = %self.name, error = %err, "configuration load failed");
                self.events.push(LifecycleEvent::LoadFailed {
                    configuration: self.name.clone(),
                    reason: err.to_string(),
                });
                self.error = Some(err.clone());
                self.set_status(LifecycleStatus::Error);
                Err(err)
            }
            Ok(loaded) => {
                self.name.clone_from(&loaded.name);
                if let Some(reason) = recording_directory_problem(&loaded.recordings_directory) {
                    tracing::warn!(
                        configuration = %self.name,
                        directory = %loaded.recordings_directory.display(),
                        reason,
                        "recording not possible for configuration"
                    );
                    self.events.push(LifecycleEvent::RecordingDirectoryUnusable {
                        configuration: self.name.clone(),
                        directory: loaded.recordings_directory.clone(),
                        reason: reason.to_string(),
                    });
                }
                self.presence = vec![false; loaded.runners.len()];
                self.loaded = Some(loaded);
                self.error = None;
                self.set_status(LifecycleStatus::NotRunning);
                Ok(())
            }
        }
    }

    /// True when the file changed on disk since it was loaded, or never loaded.
    #[must_use]
    pub fn needs_reload(&self) -> bool {
        let Some(loaded) = &self.loaded else {
            return true;
        };
        let current = std::fs::metadata(&self.path).and_then(|m| m.modified()).ok();
        match (current, loaded.modified) {
            (Some(current), Some(seen)) => current > seen,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Launch the configuration's runners and arm the startup deadline.
    pub fn startup(
        &mut self,
        launcher: &dyn Launcher,
        completion: LaunchCompletion,
        now: Instant,
    ) -> Result<(), LoadError> {
        if self.needs_reload() {
            self.load()?;
        }
        self.presence.iter_mut().for_each(|bit| *bit = false);
        self.presence_count = 0;
        self.started = true;
        self.partial_confirm_at = None;
        self.startup_deadline = Some(now + self.timing.startup_timeout);
        self.set_status(self.derived_status());

        let Some(loaded) = self.loaded.as_ref() else {
            return Err(LoadError::NotLoaded);
        };
        tracing::info!(
            configuration = %self.name,
            runners = loaded.runners.len(),
            "starting configuration"
        );
        launcher.launch(loaded, completion);
        Ok(())
    }

    /// Launcher finished. A cancelled launch disarms the startup deadline
    /// without reporting anything.
    pub fn launcher_done(&mut self, outcome: LaunchOutcome) {
        if outcome == LaunchOutcome::Cancelled && self.startup_deadline.take().is_some() {
            tracing::info!(configuration = %self.name, "launch cancelled");
            self.set_status(self.derived_status());
        }
    }

    // -------------------------------------------------------------------------
    // Presence
    // -------------------------------------------------------------------------

    fn expected_index(&self, id: &RunnerId) -> Option<usize> {
        self.loaded
            .as_ref()
            .and_then(|l| l.runners.iter().position(|r| r.id == *id))
    }

    /// A runner of this configuration started reporting.
    pub fn found_runner(&mut self, id: &RunnerId, recording: bool, now: Instant) {
        if let Some(index) = self.expected_index(id) {
            if !self.presence[index] {
                self.presence[index] = true;
                self.presence_count += 1;
                self.check_running_count(now);
            }
        } else {
            tracing::debug!(configuration = %self.name, runner = %id, "unexpected runner");
        }
        if recording {
            self.set_recording_state(true);
        }
    }

    /// A runner of this configuration went away.
    pub fn lost_runner(&mut self, id: &RunnerId, now: Instant) {
        if let Some(index) = self.expected_index(id) {
            if self.presence[index] {
                self.presence[index] = false;
                self.presence_count -= 1;
                self.check_running_count(now);
            }
        }
    }

    fn check_running_count(&mut self, now: Instant) {
        let mut status = self.derived_status();
        if status == LifecycleStatus::Partial
            && self.started
            && !self.shutting_down
            && self.status.is_running()
            && self.status != LifecycleStatus::Partial
        {
            self.partial_confirm_at = Some(now + self.timing.partial_confirm_delay);
        }
        if status == LifecycleStatus::Running && self.startup_deadline.take().is_some() {
            self.startup_finished();
            status = self.derived_status();
        }
        self.set_status(status);
    }

    /// Missing runner names and their unique hosts.
    #[must_use]
    pub fn missing_runners(&self) -> (Vec<String>, Vec<String>) {
        let mut names = Vec::new();
        let mut hosts: Vec<String> = Vec::new();
        if let Some(loaded) = &self.loaded {
            for (runner, present) in loaded.runners.iter().zip(&self.presence) {
                if !present {
                    names.push(runner.name().to_string());
                    if !hosts.iter().any(|h| h.as_str() == runner.host()) {
                        hosts.push(runner.host().to_string());
                    }
                }
            }
        }
        (names, hosts)
    }

    fn startup_finished(&mut self) {
        if self.presence_count == self.presence.len() {
            tracing::info!(configuration = %self.name, "all runners launched");
            self.events.push(LifecycleEvent::LaunchSucceeded {
                configuration: self.name.clone(),
            });
            return;
        }
        let none_reported = self.presence_count == 0;
        if none_reported {
            self.started = false;
        }
        let (missing, hosts) = self.missing_runners();
        tracing::error!(
            configuration = %self.name,
            missing = ?missing,
            hosts = ?hosts,
            "startup deadline passed with runners missing"
        );
        self.events.push(LifecycleEvent::LaunchFailed {
            configuration: self.name.clone(),
            missing,
            hosts,
            none_reported,
        });
    }

    /// Fire expired timers.
    pub fn poll(&mut self, now: Instant) {
        if self.startup_deadline.is_some_and(|deadline| now >= deadline) {
            self.startup_deadline = None;
            self.startup_finished();
            self.set_status(self.derived_status());
        }
        if self.partial_confirm_at.is_some_and(|at| now >= at) {
            self.partial_confirm_at = None;
            if self.status == LifecycleStatus::Partial && !self.shutting_down {
                let (missing, hosts) = self.missing_runners();
                tracing::warn!(
                    configuration = %self.name,
                    missing = ?missing,
                    "configuration lost runners"
                );
                self.events.push(LifecycleEvent::RunnersLost {
                    configuration: self.name.clone(),
                    missing,
                    hosts,
                });
            }
        }
    }

    // -------------------------------------------------------------------------
    // Overlay and shutdown
    // -------------------------------------------------------------------------

    pub fn set_recording_state(&mut self, recording: bool) {
        if recording != self.recording {
            self.recording = recording;
            self.events.push(LifecycleEvent::StatusChanged {
                configuration: self.name.clone(),
                from: self.status,
                to: self.status,
                recording,
            });
        }
    }

    /// Operator-initiated shutdown in progress; suppresses loss prompts.
    pub fn mark_shutting_down(&mut self) {
        self.shutting_down = true;
        self.partial_confirm_at = None;
    }

    /// Forget all presence and timers after a cluster cleanup.
    pub fn force_not_running(&mut self) {
        if self.loaded.is_none() {
            return;
        }
        self.presence.iter_mut().for_each(|bit| *bit = false);
        self.presence_count = 0;
        self.startup_deadline = None;
        self.partial_confirm_at = None;
        self.set_recording_state(false);
        self.set_status(LifecycleStatus::NotRunning);
    }
}

/// Why a recordings directory cannot be used, if it cannot.
///
/// Writability is checked by creating an anonymous temporary file in the
/// directory, which reflects effective access rather than mode bits.
#[must_use]
pub fn recording_directory_problem(dir: &Path) -> Option<&'static str> {
    match std::fs::metadata(dir) {
        Err(_) => Some("does not exist"),
        Ok(meta) if !meta.is_dir() => Some("is not a directory"),
        Ok(_) => match tempfile::tempfile_in(dir) {
            Ok(_) => None,
            Err(err) => {
                tracing::debug!(directory = %dir.display(), error = %err, "write check failed");
                Some("does not permit writing")
            }
        },
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Every configuration known to the master.
#[derive(Debug, Default)]
pub struct ConfigurationRegistry {
    entries: Vec<ConfigurationEntry>,
    timing: LifecycleTiming,
}

impl ConfigurationRegistry {
    #[must_use]
    pub fn new(timing: LifecycleTiming) -> Self {
        Self {
            entries: Vec::new(),
            timing,
        }
    }

    /// Add a configuration by path and load it. An already-known path is
    /// reloaded instead.
    pub fn add(&mut self, path: impl Into<PathBuf>) -> &mut ConfigurationEntry {
        let path = path.into();
        let index = match self.entries.iter().position(|e| e.path == path) {
            Some(index) => index,
            None => {
                self.entries.push(ConfigurationEntry::new(path, self.timing));
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[index];
        if let Err(err) = entry.load() {
            tracing::debug!(path = %entry.path.display(), error = %err, "configuration load failed");
        }
        entry
    }

    pub fn remove(&mut self, name: &str) -> Option<ConfigurationEntry> {
        let index = self.entries.iter().position(|e| e.name == name)?;
        Some(self.entries.remove(index))
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ConfigurationEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ConfigurationEntry> {
        self.entries.iter_mut().find(|e| e.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigurationEntry> {
        self.entries.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConfigurationEntry> {
        self.entries.iter_mut()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn found_runner(&mut self, id: &RunnerId, recording: bool, now: Instant) {
        if let Some(entry) = self.get_mut(&id.configuration) {
            entry.found_runner(id, recording, now);
        }
    }

    pub fn lost_runner(&mut self, id: &RunnerId, now: Instant) {
        if let Some(entry) = self.get_mut(&id.configuration) {
            entry.lost_runner(id, now);
        }
    }

    pub fn poll(&mut self, now: Instant) {
        for entry in &mut self.entries {
            entry.poll(now);
        }
    }

    pub fn drain_events(&mut self) -> Vec<LifecycleEvent> {
        self.entries
            .iter_mut()
            .flat_map(ConfigurationEntry::drain_events)
            .collect()
    }

    /// Names of configurations that are running and can record right now.
    #[must_use]
    pub fn recordable_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.is_running() && e.can_record())
            .map(|e| e.name.clone())
            .collect()
    }

    /// Unique hosts across every loaded configuration.
    #[must_use]
    pub fn all_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::new();
        for loaded in self.entries.iter().filter_map(ConfigurationEntry::loaded) {
            for host in &loaded.host_names {
                if !hosts.contains(host) {
                    hosts.push(host.clone());
                }
            }
        }
        hosts
    }

    /// Distinct recordings directories of loaded configurations.
    #[must_use]
    pub fn recordings_roots(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = Vec::new();
        for dir in self.entries.iter().filter_map(ConfigurationEntry::recordings_directory) {
            if !roots.iter().any(|r| r == dir) {
                roots.push(dir.to_path_buf());
            }
        }
        roots
    }

    /// Apply a disk-usage sample to every configuration recording under `root`.
    pub fn disk_usage(&mut self, usage: &DiskUsage) -> bool {
        let mut changed = false;
        for entry in &mut self.entries {
            if entry.recordings_directory() == Some(usage.root.as_path()) {
                changed |= entry.set_disk_usage(usage.clone());
            }
        }
        changed
    }

    pub fn set_recording_state(&mut self, names: &[String], recording: bool) {
        for entry in &mut self.entries {
            if names.contains(&entry.name) {
                entry.set_recording_state(recording);
            }
        }
    }
}
