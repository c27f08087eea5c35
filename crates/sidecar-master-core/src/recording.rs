//! Recording sessions.
//!
//! A recording spans every recordable configuration at the moment it starts.
//! Each distinct recordings directory gets one session subdirectory named
//! `yyyyMMdd-hhmmss-<seq>[-CAL]`, a `last` symlink pointing at it, a copy of
//! each configuration file, and a `notes.txt` sidecar describing the session.
//!
//! ```text
//! Configurations: alpha bravo
//! Duration: +00:10:00
//! Dropped Messages: 0
//! Duplicate Messages: 3
//! Radar Transmitting: YES - Frequency: 9400 MHz
//! Radar Rotating: YES - Rate: 6 rpm
//! Using DRFM: NO
//!
//! free text notes...
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use serde::Serialize;

pub const SIDECAR_FILE_NAME: &str = "notes.txt";
pub const LAST_LINK_NAME: &str = "last";

const NAME_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const CAL_SUFFIX: &str = "CAL";

/// Recording failures. The `Display` text is what remote clients see.
#[derive(Debug, thiserror::Error)]
pub enum RecordingError {
    #[error("No configuration file loaded in Master")]
    NoLoadedConfig,

    #[error("Failed to create recording directory")]
    FailedCreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to setup recording directory")]
    FailedRecordingSetup { path: PathBuf, reason: String },

    #[error("Failed to start recording")]
    FailedPostRecordingStateChange,

    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    #[error("Unknown recording '{0}'")]
    UnknownSession(String),

    #[error("Recording '{0}' is still active")]
    SessionActive(String),

    #[error("Invalid recording name '{0}'")]
    InvalidName(String),

    #[error("Failed to remove {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Session names
// =============================================================================

/// Parsed `yyyyMMdd-hhmmss-<seq>[-CAL]` session name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionName {
    pub stamp: NaiveDateTime,
    pub sequence: u32,
    pub calibration: bool,
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.stamp.format(NAME_STAMP_FORMAT), self.sequence)?;
        if self.calibration {
            write!(f, "-{CAL_SUFFIX}")?;
        }
        Ok(())
    }
}

impl FromStr for SessionName {
    type Err = RecordingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RecordingError::InvalidName(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        let (date, time, sequence, calibration) = match parts.as_slice() {
            [date, time, seq] => (*date, *time, *seq, false),
            [date, time, seq, CAL_SUFFIX] => (*date, *time, *seq, true),
            _ => return Err(invalid()),
        };
        if date.len() != 8 || time.len() != 6 {
            return Err(invalid());
        }
        let stamp = NaiveDateTime::parse_from_str(&format!("{date}-{time}"), NAME_STAMP_FORMAT)
            .map_err(|_| invalid())?;
        let sequence = sequence.parse().map_err(|_| invalid())?;
        Ok(Self {
            stamp,
            sequence,
            calibration,
        })
    }
}

/// Sequence number embedded in a directory name, tolerating old-style names.
fn sequence_of(name: &str) -> Option<u32> {
    name.split('-').nth(2).and_then(|seq| seq.parse().ok())
}

/// Start time encoded in a directory name.
fn start_time_of(name: &str) -> Option<DateTime<Utc>> {
    let mut parts = name.split('-');
    let stamp = format!("{}-{}", parts.next()?, parts.next()?);
    NaiveDateTime::parse_from_str(&stamp, NAME_STAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// `HH:MM:SS` for a non-negative number of seconds.
#[must_use]
pub fn format_elapsed(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds / 60) % 60,
        seconds % 60
    )
}

/// ` -HH:MM:SS` countdown text.
#[must_use]
pub fn format_remaining(seconds: i64) -> String {
    format!(" -{}", format_elapsed(seconds))
}

// =============================================================================
// Sidecar
// =============================================================================

/// Operator-supplied session notes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionNotes {
    /// Transmit frequency in MHz when the radar was transmitting.
    pub radar_transmitting: Option<f64>,
    /// Rotation rate in rpm when the radar was rotating.
    pub radar_rotating: Option<f64>,
    /// DRFM configuration when a DRFM was in use.
    pub drfm: Option<String>,
    pub text: String,
}

/// Contents of a `notes.txt` file.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Sidecar {
    pub configurations: Vec<String>,
    /// `HH:MM:SS`.
    pub duration: String,
    pub drop_count: u64,
    pub dupe_count: u64,
    pub notes: SessionNotes,
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "YES" } else { "NO" }
}

impl Sidecar {
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!(
            "Configurations: {}\nDuration: +{}\nDropped Messages: {}\nDuplicate Messages: {}\n",
            self.configurations.join(" "),
            self.duration,
            self.drop_count,
            self.dupe_count
        );
        let notes = &self.notes;
        out.push_str(&format!(
            "Radar Transmitting: {}",
            yes_no(notes.radar_transmitting.is_some())
        ));
        if let Some(frequency) = notes.radar_transmitting {
            out.push_str(&format!(" - Frequency: {frequency} MHz"));
        }
        out.push_str(&format!("\nRadar Rotating: {}", yes_no(notes.radar_rotating.is_some())));
        if let Some(rate) = notes.radar_rotating {
            out.push_str(&format!(" - Rate: {rate} rpm"));
        }
        out.push_str(&format!("\nUsing DRFM: {}", yes_no(notes.drfm.is_some())));
        if let Some(drfm) = &notes.drfm {
            out.push_str(&format!(" - Configuration: {drfm}"));
        }
        out.push_str("\n\n");
        out.push_str(&notes.text);
        out
    }

    /// Parse a sidecar. Missing trailing lines leave defaults; only a missing
    /// `Configurations:` line is an error.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let mut lines = text.split_inclusive('\n');
        let split = |line: &str| -> Vec<String> {
            line.split_whitespace().map(str::to_string).collect()
        };

        let configurations = split(lines.next()?);
        if configurations.first().map(String::as_str) != Some("Configurations:") {
            return None;
        }
        let mut sidecar = Self {
            configurations: configurations[1..].to_vec(),
            ..Self::default()
        };

        if let Some(tokens) = lines.next().map(split) {
            if let Some(duration) = tokens.get(1) {
                sidecar.duration = duration.trim_start_matches('+').to_string();
            }
        }
        if let Some(tokens) = lines.next().map(split) {
            sidecar.drop_count = tokens.get(2).and_then(|t| t.parse().ok()).unwrap_or_default();
        }
        if let Some(tokens) = lines.next().map(split) {
            sidecar.dupe_count = tokens.get(2).and_then(|t| t.parse().ok()).unwrap_or_default();
        }
        if let Some(tokens) = lines.next().map(split) {
            if tokens.len() == 7 {
                sidecar.notes.radar_transmitting = tokens[5].parse().ok();
            }
        }
        if let Some(tokens) = lines.next().map(split) {
            if tokens.len() == 7 {
                sidecar.notes.radar_rotating = tokens[5].parse().ok();
            }
        }
        if let Some(line) = lines.next() {
            sidecar.notes.drfm = parse_drfm(line);
        }
        let _blank = lines.next();
        sidecar.notes.text = lines.collect();
        Some(sidecar)
    }
}

/// Free text after `Using DRFM: YES - Configuration:`, kept verbatim.
fn parse_drfm(line: &str) -> Option<String> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (_, rest) = line.split_once(" - ")?;
    let rest = rest.strip_prefix("Configuration:").unwrap_or(rest);
    Some(rest.strip_prefix(' ').unwrap_or(rest).to_string())
}

// =============================================================================
// Sessions
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordingSession {
    pub name: String,
    pub directories: Vec<PathBuf>,
    pub configuration_names: Vec<String>,
    pub start_time: Option<DateTime<Utc>>,
    /// Configured duration limit.
    pub duration: Option<Duration>,
    /// `HH:MM:SS`; empty when a restored session had no readable sidecar.
    pub elapsed: String,
    /// Countdown text while a duration limit is running.
    pub remaining: String,
    pub drop_count: u64,
    pub dupe_count: u64,
    pub done: bool,
    pub notes: SessionNotes,
}

impl RecordingSession {
    #[must_use]
    pub fn sidecar(&self) -> Sidecar {
        Sidecar {
            configurations: self.configuration_names.clone(),
            duration: self.elapsed.clone(),
            drop_count: self.drop_count,
            dupe_count: self.dupe_count,
            notes: self.notes.clone(),
        }
    }

    /// Write the sidecar into every session directory. Returns false if any
    /// write failed.
    pub fn save(&self) -> bool {
        let text = self.sidecar().render();
        let mut ok = true;
        for dir in &self.directories {
            let path = dir.join(SIDECAR_FILE_NAME);
            if let Err(err) = std::fs::write(&path, &text) {
                tracing::warn!(path = %path.display(), error = %err, "failed to write recording notes");
                ok = false;
            }
        }
        ok
    }

    fn load_sidecar(&mut self) -> bool {
        for dir in &self.directories {
            let Ok(text) = std::fs::read_to_string(dir.join(SIDECAR_FILE_NAME)) else {
                continue;
            };
            let Some(sidecar) = Sidecar::parse(&text) else {
                continue;
            };
            self.configuration_names = sidecar.configurations;
            self.elapsed = sidecar.duration;
            self.drop_count = sidecar.drop_count;
            self.dupe_count = sidecar.dupe_count;
            self.notes = sidecar.notes;
            return true;
        }
        false
    }

    fn append_entry(&mut self, now: DateTime<Utc>, text: &str) {
        self.notes
            .text
            .push_str(&format!("{} {text}\n", now.format("%H:%M:%S")));
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    #[default]
    Idle,
    Starting,
    Active,
    Stopping,
}

/// What the controller needs from the rest of the master.
pub trait RecordingTargets {
    fn recordings_directory(&self, configuration: &str) -> Option<PathBuf>;
    fn configuration_path(&self, configuration: &str) -> Option<PathBuf>;
    fn is_calibrating(&self, configurations: &[String]) -> bool;
    /// Formatted runtime parameter deviations.
    fn changed_parameters(&self, configurations: &[String]) -> Vec<String>;
    fn post_recording_start(&self, targets: &[(String, PathBuf)]) -> bool;
    fn post_recording_stop(&self, configurations: &[String]) -> bool;
    /// Aggregate drop and duplicate counts.
    fn drops_and_dupes(&self, configurations: &[String]) -> (u64, u64);
}

#[derive(Debug)]
pub struct RecordingController {
    sessions: Vec<RecordingSession>,
    active: Option<String>,
    state: RecordingState,
    next_sequence: u32,
    duration_limit: Option<Duration>,
    baseline: (u64, u64),
}

impl Default for RecordingController {
    fn default() -> Self {
        Self::new(1)
    }
}

impl RecordingController {
    #[must_use]
    pub const fn new(initial_sequence: u32) -> Self {
        Self {
            sessions: Vec::new(),
            active: None,
            state: RecordingState::Idle,
            next_sequence: initial_sequence,
            duration_limit: None,
            baseline: (0, 0),
        }
    }

    #[must_use]
    pub fn sessions(&self) -> &[RecordingSession] {
        &self.sessions
    }

    #[must_use]
    pub fn session(&self, name: &str) -> Option<&RecordingSession> {
        self.sessions.iter().find(|s| s.name == name)
    }

    fn session_mut(&mut self, name: &str) -> Option<&mut RecordingSession> {
        self.sessions.iter_mut().find(|s| s.name == name)
    }

    #[must_use]
    pub fn active(&self) -> Option<&RecordingSession> {
        self.active.as_deref().and_then(|name| self.session(name))
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    #[must_use]
    pub const fn state(&self) -> RecordingState {
        self.state
    }

    #[must_use]
    pub const fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    #[must_use]
    pub const fn duration_limit(&self) -> Option<Duration> {
        self.duration_limit
    }

    /// Duration limit applied to the next recording.
    pub fn set_duration_limit(&mut self, limit: Option<Duration>) {
        self.duration_limit = limit;
    }

    /// Start recording the named configurations. Returns the session name.
    pub fn start(
        &mut self,
        configurations: &[String],
        targets: &dyn RecordingTargets,
        now: DateTime<Utc>,
    ) -> Result<String, RecordingError> {
        if self.active.is_some() {
            return Err(RecordingError::AlreadyRecording);
        }
        if configurations.is_empty() {
            tracing::error!("no configurations to record");
            return Err(RecordingError::NoLoadedConfig);
        }

        self.state = RecordingState::Starting;
        let stamp = now.naive_utc();
        let name = SessionName {
            stamp: stamp.with_nanosecond(0).unwrap_or(stamp),
            sequence: self.next_sequence,
            calibration: targets.is_calibrating(configurations),
        }
        .to_string();

        let mut created: Vec<PathBuf> = Vec::new();
        let prepared = prepare_directories(&name, configurations, targets, &mut created);
        let paths = match prepared {
            Ok(paths) => paths,
            Err(err) => {
                tracing::error!(recording = %name, error = %err, "recording setup failed");
                remove_created(&created);
                self.state = RecordingState::Idle;
                return Err(err);
            }
        };

        let mut session = RecordingSession {
            name: name.clone(),
            directories: created.clone(),
            configuration_names: configurations.to_vec(),
            start_time: Some(now),
            duration: self.duration_limit,
            elapsed: format_elapsed(0),
            remaining: self
                .duration_limit
                .map(|d| format_remaining(i64::try_from(d.as_secs()).unwrap_or(i64::MAX)))
                .unwrap_or_default(),
            drop_count: 0,
            dupe_count: 0,
            done: false,
            notes: SessionNotes::default(),
        };
        session.append_entry(now, "*** STARTED ***");
        for change in targets.changed_parameters(configurations) {
            session.notes.text.push_str(&change);
        }

        if !targets.post_recording_start(&paths) {
            tracing::error!(recording = %name, "failed to command runners to start recording");
            let _ = targets.post_recording_stop(configurations);
            remove_created(&created);
            self.state = RecordingState::Idle;
            return Err(RecordingError::FailedPostRecordingStateChange);
        }

        self.baseline = targets.drops_and_dupes(configurations);
        self.next_sequence += 1;
        session.save();
        tracing::info!(recording = %name, directories = created.len(), "started recording");
        self.sessions.push(session);
        self.active = Some(name.clone());
        self.state = RecordingState::Active;
        Ok(name)
    }

    /// Advance the active session's clock. Returns the stop result when the
    /// duration limit ran out and the session was stopped.
    pub fn tick(
        &mut self,
        targets: &dyn RecordingTargets,
        now: DateTime<Utc>,
    ) -> Option<Result<String, RecordingError>> {
        let name = self.active.clone()?;
        let (drops, dupes) = targets.drops_and_dupes(&self.session(&name)?.configuration_names);
        let baseline = self.baseline;
        let session = self.session_mut(&name)?;

        let elapsed = session
            .start_time
            .map_or(0, |start| (now - start).num_seconds().max(0));
        session.elapsed = format_elapsed(elapsed);
        session.drop_count = drops.saturating_sub(baseline.0);
        session.dupe_count = dupes.saturating_sub(baseline.1);

        let expired = match session.duration {
            Some(limit) => {
                let remaining = i64::try_from(limit.as_secs()).unwrap_or(i64::MAX) - elapsed;
                if remaining <= 0 {
                    session.remaining.clear();
                    true
                } else {
                    session.remaining = format_remaining(remaining);
                    false
                }
            }
            None => false,
        };

        if expired {
            tracing::info!(recording = %name, "recording duration reached");
            Some(self.stop(true, targets, now))
        } else {
            None
        }
    }

    /// Stop the active session. The session is marked done even when the
    /// runners could not be told to stop.
    pub fn stop(
        &mut self,
        by_duration: bool,
        targets: &dyn RecordingTargets,
        now: DateTime<Utc>,
    ) -> Result<String, RecordingError> {
        let Some(name) = self.active.take() else {
            return Err(RecordingError::NotRecording);
        };
        self.state = RecordingState::Stopping;
        let baseline = self.baseline;
        let Some(session) = self.session_mut(&name) else {
            self.state = RecordingState::Idle;
            return Err(RecordingError::UnknownSession(name));
        };

        let posted = targets.post_recording_stop(&session.configuration_names);
        let (drops, dupes) = targets.drops_and_dupes(&session.configuration_names);
        session.drop_count = drops.saturating_sub(baseline.0);
        session.dupe_count = dupes.saturating_sub(baseline.1);
        if let Some(start) = session.start_time {
            session.elapsed = format_elapsed((now - start).num_seconds());
        }
        session.remaining.clear();
        session.done = true;
        session.append_entry(
            now,
            if by_duration {
                "*** STOPPED *** (duration limit)"
            } else {
                "*** STOPPED ***"
            },
        );
        session.save();
        self.state = RecordingState::Idle;

        if posted {
            tracing::info!(recording = %name, by_duration, "stopped recording");
            Ok(name)
        } else {
            tracing::error!(recording = %name, "failed to command runners to stop recording");
            Err(RecordingError::FailedPostRecordingStateChange)
        }
    }

    /// Stop any active session.
    pub fn reset(&mut self, targets: &dyn RecordingTargets, now: DateTime<Utc>) {
        if self.active.is_some() {
            if let Err(err) = self.stop(false, targets, now) {
                tracing::warn!(error = %err, "stop during reset failed");
            }
        }
    }

    /// Rebuild today's sessions from the recordings roots. Returns the names of
    /// sessions whose sidecar could not be read.
    pub fn restore(&mut self, roots: &[PathBuf], today: NaiveDate) -> Vec<String> {
        let prefix = format!("{}-", today.format("%Y%m%d"));
        let mut failed = Vec::new();
        for root in roots {
            let entries = match std::fs::read_dir(root) {
                Ok(entries) => entries,
                Err(err) => {
                    tracing::warn!(root = %root.display(), error = %err, "cannot scan recordings root");
                    continue;
                }
            };
            let mut dirs: Vec<(String, PathBuf)> = entries
                .filter_map(Result::ok)
                .filter_map(|entry| {
                    let name = entry.file_name().to_str()?.to_string();
                    let path = entry.path();
                    (name != LAST_LINK_NAME && name.starts_with(&prefix) && path.is_dir())
                        .then_some((name, path))
                })
                .collect();
            dirs.sort();

            for (name, path) in dirs {
                if let Some(existing) = self.session_mut(&name) {
                    if !existing.directories.contains(&path) {
                        existing.directories.push(path);
                    }
                    continue;
                }
                let mut session = RecordingSession {
                    start_time: start_time_of(&name),
                    name: name.clone(),
                    directories: vec![path],
                    configuration_names: Vec::new(),
                    duration: None,
                    elapsed: String::new(),
                    remaining: String::new(),
                    drop_count: 0,
                    dupe_count: 0,
                    done: true,
                    notes: SessionNotes::default(),
                };
                if !session.load_sidecar() || session.elapsed.is_empty() {
                    tracing::warn!(recording = %name, "recording notes missing or unreadable");
                    failed.push(name.clone());
                }
                if let Some(sequence) = sequence_of(&name) {
                    if sequence >= self.next_sequence {
                        self.next_sequence = sequence.saturating_add(1);
                    }
                }
                self.sessions.push(session);
            }
        }
        tracing::info!(sessions = self.sessions.len(), failed = failed.len(), "restored recordings");
        failed
    }

    /// Delete a finished session and every directory it recorded into.
    pub fn delete(&mut self, name: &str) -> Result<(), RecordingError> {
        let index = self
            .sessions
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| RecordingError::UnknownSession(name.to_string()))?;
        if !self.sessions[index].done {
            return Err(RecordingError::SessionActive(name.to_string()));
        }
        for dir in &self.sessions[index].directories {
            match std::fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(RecordingError::Remove {
                        path: dir.clone(),
                        source,
                    });
                }
            }
        }
        self.sessions.remove(index);
        tracing::info!(recording = name, "deleted recording");
        Ok(())
    }

    /// Replace a session's notes and rewrite its sidecars.
    pub fn update_notes(&mut self, name: &str, notes: SessionNotes) -> Result<(), RecordingError> {
        let session = self
            .session_mut(name)
            .ok_or_else(|| RecordingError::UnknownSession(name.to_string()))?;
        session.notes = notes;
        session.save();
        Ok(())
    }
}

/// Create the session directory under every distinct recordings directory and
/// copy each configuration file into it. Created directories are pushed onto
/// `created` as they appear.
fn prepare_directories(
    name: &str,
    configurations: &[String],
    targets: &dyn RecordingTargets,
    created: &mut Vec<PathBuf>,
) -> Result<Vec<(String, PathBuf)>, RecordingError> {
    let mut parents: Vec<(PathBuf, PathBuf)> = Vec::new();
    let mut paths = Vec::with_capacity(configurations.len());

    for configuration in configurations {
        let parent = targets
            .recordings_directory(configuration)
            .ok_or(RecordingError::NoLoadedConfig)?;
        let recording_dir = if let Some((_, dir)) = parents.iter().find(|(p, _)| *p == parent) {
            dir.clone()
        } else {
            let dir = parent.join(name);
            std::fs::create_dir(&dir).map_err(|source| RecordingError::FailedCreateDirectory {
                path: dir.clone(),
                source,
            })?;
            created.push(dir.clone());
            setup_directory(&parent, &dir)?;
            parents.push((parent, dir.clone()));
            dir
        };

        let source = targets
            .configuration_path(configuration)
            .ok_or(RecordingError::NoLoadedConfig)?;
        let file_name = source.file_name().map(ToOwned::to_owned).unwrap_or_default();
        std::fs::copy(&source, recording_dir.join(file_name)).map_err(|err| {
            RecordingError::FailedRecordingSetup {
                path: source.clone(),
                reason: err.to_string(),
            }
        })?;
        paths.push((configuration.clone(), recording_dir));
    }
    Ok(paths)
}

/// Open the session directory to everyone and repoint `<parent>/last` at it.
fn setup_directory(parent: &Path, dir: &Path) -> Result<(), RecordingError> {
    let setup_err = |err: std::io::Error| RecordingError::FailedRecordingSetup {
        path: dir.to_path_buf(),
        reason: err.to_string(),
    };

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(dir).map_err(setup_err)?.permissions();
        perms.set_mode(perms.mode() | 0o666);
        std::fs::set_permissions(dir, perms).map_err(setup_err)?;
    }

    let last = parent.join(LAST_LINK_NAME);
    if std::fs::symlink_metadata(&last).is_ok() {
        std::fs::remove_file(&last).map_err(setup_err)?;
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(dir, &last).map_err(setup_err)?;
    Ok(())
}

fn remove_created(created: &[PathBuf]) {
    for dir in created {
        if let Err(err) = std::fs::remove_dir_all(dir) {
            tracing::warn!(path = %dir.display(), error = %err, "failed to remove recording directory");
        }
    }
}
