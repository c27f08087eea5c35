//! The master's core event loop.
//!
//! [`Master`] owns the status tree, the configuration registry and the
//! recording controller. Nothing else mutates them: status datagrams,
//! discovery notifications, launcher completions, worker reports, remote
//! control requests and operator actions all arrive as messages and are
//! applied one at a time by [`Master::run`]. Two timers drive the rest: a
//! one-second tick for recording clocks and a short presence tick for startup
//! deadlines and partial-loss confirmation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::config::Config;
use crate::discovery::{Endpoint, ServiceEntry};
use crate::dispatch::{CommandDispatcher, RpcClient};
use crate::launcher::{LaunchCompletion, LaunchOutcome, Launcher};
use crate::lifecycle::{ConfigurationRegistry, LifecycleEvent};
use crate::loader::LoadError;
use crate::processing_state::ProcessingState;
use crate::recording::{RecordingController, RecordingError, RecordingTargets, SessionNotes};
use crate::remote_control::{RemoteCommand, RemoteReply, RemoteRequest};
use crate::status::{RunnerId, RunnerStatus, StatusError, decode_status};
use crate::tree::StatusTree;
use crate::workers::{DiskSpacePoller, HostKiller, WorkerReport, spawn_cleanup};

const NOW_TICK: Duration = Duration::from_secs(1);

// =============================================================================
// Messages
// =============================================================================

/// Failure of an operator action. The `Display` text goes to the status bar.
#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Recording(#[from] RecordingError),

    #[error("Unknown configuration '{0}'")]
    UnknownConfiguration(String),

    #[error("Failed to post {0} request.")]
    PostFailed(&'static str),

    #[error("Failed to start worker: {0}")]
    Worker(#[source] std::io::Error),

    #[error("Master is not running")]
    Closed,
}

pub type ActionResult = Result<String, OperatorError>;

/// Something the operator asked for.
#[derive(Debug, Clone, PartialEq)]
pub enum OperatorAction {
    Load(PathBuf),
    Startup(String),
    Shutdown(String),
    ChangeState {
        configurations: Vec<String>,
        state: ProcessingState,
    },
    ClearStats(Vec<String>),
    StartRecording,
    StopRecording,
    DeleteRecording(String),
    UpdateNotes {
        name: String,
        notes: SessionNotes,
    },
    SetDurationLimit(Option<Duration>),
    SetRecordable {
        configuration: String,
        recordable: bool,
    },
    Cleanup,
}

#[derive(Debug)]
pub enum CoreMessage {
    Status(RunnerStatus),
    ServiceFound(ServiceEntry),
    ServiceLost(RunnerId),
    LaunchDone {
        configuration: String,
        outcome: LaunchOutcome,
    },
    Operator {
        action: OperatorAction,
        reply: Option<oneshot::Sender<ActionResult>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordingEvent {
    Started {
        name: String,
    },
    Progress {
        name: String,
        elapsed: String,
        remaining: String,
        drop_count: u64,
        dupe_count: u64,
    },
    Stopped {
        name: String,
        by_duration: bool,
    },
}

/// What the master tells the outside world.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MasterEvent {
    StatusMessage { text: String },
    Alert {
        title: String,
        text: String,
        hosts: Vec<String>,
    },
    Lifecycle(LifecycleEvent),
    Recording(RecordingEvent),
}

/// Cloneable sender side of the core loop.
#[derive(Debug, Clone)]
pub struct MasterHandle {
    tx: mpsc::UnboundedSender<CoreMessage>,
}

impl MasterHandle {
    /// Queue a message. False when the loop has exited.
    pub fn send(&self, message: CoreMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    /// Run an operator action on the core loop and wait for its result.
    pub async fn perform(&self, action: OperatorAction) -> ActionResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        let message = CoreMessage::Operator {
            action,
            reply: Some(reply_tx),
        };
        if !self.send(message) {
            return Err(OperatorError::Closed);
        }
        reply_rx.await.unwrap_or(Err(OperatorError::Closed))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(CoreMessage::Shutdown);
    }
}

/// External collaborators the master drives.
#[derive(Clone)]
pub struct Collaborators {
    pub launcher: Arc<dyn Launcher>,
    pub rpc: Arc<dyn RpcClient>,
    pub killer: Arc<dyn HostKiller>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

// =============================================================================
// Recording targets
// =============================================================================

/// Borrowed view the recording controller works through.
struct Targets<'a> {
    tree: &'a StatusTree,
    registry: &'a ConfigurationRegistry,
    dispatcher: &'a CommandDispatcher,
}

impl RecordingTargets for Targets<'_> {
    fn recordings_directory(&self, configuration: &str) -> Option<PathBuf> {
        self.registry
            .get(configuration)
            .and_then(|entry| entry.recordings_directory())
            .map(std::path::Path::to_path_buf)
    }

    fn configuration_path(&self, configuration: &str) -> Option<PathBuf> {
        self.registry
            .get(configuration)
            .map(|entry| entry.path().to_path_buf())
    }

    fn is_calibrating(&self, configurations: &[String]) -> bool {
        self.tree.is_calibrating(configurations)
    }

    fn changed_parameters(&self, configurations: &[String]) -> Vec<String> {
        self.dispatcher
            .changed_parameters(self.tree, configurations)
            .lines
    }

    fn post_recording_start(&self, targets: &[(String, PathBuf)]) -> bool {
        self.dispatcher.post_recording_start(self.tree, targets)
    }

    fn post_recording_stop(&self, configurations: &[String]) -> bool {
        self.dispatcher.post_recording_stop(self.tree, configurations)
    }

    fn drops_and_dupes(&self, configurations: &[String]) -> (u64, u64) {
        self.tree.drops_and_dupes(configurations)
    }
}

// =============================================================================
// Master
// =============================================================================

pub struct Master {
    config: Config,
    tree: StatusTree,
    registry: ConfigurationRegistry,
    recorder: RecordingController,
    dispatcher: CommandDispatcher,
    launcher: Arc<dyn Launcher>,
    killer: Arc<dyn HostKiller>,
    /// Services reported by discovery and their resolved endpoints.
    services: HashMap<RunnerId, Option<Endpoint>>,
    events: mpsc::UnboundedSender<MasterEvent>,
    core_tx: mpsc::UnboundedSender<CoreMessage>,
    core_rx: Option<mpsc::UnboundedReceiver<CoreMessage>>,
    worker_tx: mpsc::UnboundedSender<WorkerReport>,
    worker_rx: Option<mpsc::UnboundedReceiver<WorkerReport>>,
    disk_poller: Option<DiskSpacePoller>,
    cleanup_running: bool,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("configurations", &self.registry.len())
            .field("nodes", &self.tree.len())
            .field("recording", &self.recorder.is_recording())
            .finish_non_exhaustive()
    }
}

impl Master {
    #[must_use]
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        events: mpsc::UnboundedSender<MasterEvent>,
    ) -> Self {
        let (core_tx, core_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        let mut recorder = RecordingController::new(config.recording.initial_sequence);
        recorder.set_duration_limit(config.recording.duration_limit());
        Self {
            registry: ConfigurationRegistry::new(config.lifecycle.timing()),
            tree: StatusTree::new(),
            recorder,
            dispatcher: CommandDispatcher::new(collaborators.rpc),
            launcher: collaborators.launcher,
            killer: collaborators.killer,
            services: HashMap::new(),
            events,
            core_tx,
            core_rx: Some(core_rx),
            worker_tx,
            worker_rx: Some(worker_rx),
            disk_poller: None,
            cleanup_running: false,
            config,
        }
    }

    #[must_use]
    pub fn handle(&self) -> MasterHandle {
        MasterHandle {
            tx: self.core_tx.clone(),
        }
    }

    #[must_use]
    pub const fn tree(&self) -> &StatusTree {
        &self.tree
    }

    #[must_use]
    pub const fn registry(&self) -> &ConfigurationRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn recorder(&self) -> &RecordingController {
        &self.recorder
    }

    fn emit(&self, event: MasterEvent) {
        let _ = self.events.send(event);
    }

    fn status_message(&self, text: impl Into<String>) {
        self.emit(MasterEvent::StatusMessage { text: text.into() });
    }

    /// Load every configuration named in the master config, then rebuild
    /// today's recording sessions.
    pub fn load_configurations(&mut self, today: NaiveDate) {
        for path in self.config.configurations.clone() {
            let name = self.registry.add(path).name().to_string();
            tracing::info!(configuration = %name, "configuration added");
        }
        self.flush_lifecycle_events();
        self.restore_sessions(today);
        self.restart_disk_poller();
    }

    /// Rebuild sessions recorded today from every recordings root.
    pub fn restore_sessions(&mut self, today: NaiveDate) {
        let mut roots = self.registry.recordings_roots();
        for root in &self.config.recording.recordings_roots {
            if !roots.contains(root) {
                roots.push(root.clone());
            }
        }
        let failed = self.recorder.restore(&roots, today);
        let restored = self.recorder.sessions().len();
        if restored > 0 {
            self.status_message(format!("Restored {restored} recording(s) from today."));
        }
        for name in failed {
            self.status_message(format!("Failed to restore recording {name}"));
        }
    }

    fn restart_disk_poller(&mut self) {
        if let Some(poller) = self.disk_poller.take() {
            poller.stop();
        }
        let roots = self.registry.recordings_roots();
        if roots.is_empty() {
            return;
        }
        match DiskSpacePoller::spawn(
            roots,
            self.config.disk_space.poll_interval(),
            self.config.disk_space.warning_percent,
            self.worker_tx.clone(),
        ) {
            Ok(poller) => self.disk_poller = Some(poller),
            Err(err) => tracing::warn!(error = %err, "failed to start disk space poller"),
        }
    }

    // -------------------------------------------------------------------------
    // Message handling
    // -------------------------------------------------------------------------

    /// Apply one message. Returns false for [`CoreMessage::Shutdown`].
    pub fn handle_message(&mut self, message: CoreMessage, now: Instant) -> bool {
        match message {
            CoreMessage::Status(status) => self.ingest_status(&status, now),
            CoreMessage::ServiceFound(entry) => self.service_found(entry),
            CoreMessage::ServiceLost(id) => self.service_lost(&id, now),
            CoreMessage::LaunchDone {
                configuration,
                outcome,
            } => {
                if let Some(entry) = self.registry.get_mut(&configuration) {
                    entry.launcher_done(outcome);
                }
            }
            CoreMessage::Operator { action, reply } => {
                let result = self.perform(action, now, Utc::now());
                match &result {
                    Ok(text) if !text.is_empty() => self.status_message(text.clone()),
                    Ok(_) => {}
                    Err(err) => self.status_message(err.to_string()),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            CoreMessage::Shutdown => return false,
        }
        self.flush_lifecycle_events();
        true
    }

    fn ingest_status(&mut self, status: &RunnerStatus, now: Instant) {
        let id = match status.runner_id() {
            Ok(id) => id,
            Err(err) => {
                tracing::debug!(error = %err, "discarding status record");
                return;
            }
        };
        if self.config.ingest.require_discovery && !self.services.contains_key(&id) {
            tracing::debug!(runner = %id, "status from undiscovered runner ignored");
            return;
        }
        let outcome = match self.tree.apply_status(status) {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(runner = %id, error = %err, "failed to apply status");
                return;
            }
        };
        if outcome.created {
            tracing::info!(runner = %id, host = %id.host, "runner reporting");
            if let Some(endpoint) = self.services.get(&id).cloned().flatten() {
                self.tree.set_endpoint(&id, Some(endpoint));
            }
        }
        self.registry.found_runner(&id, outcome.recording, now);
    }

    fn service_found(&mut self, entry: ServiceEntry) {
        tracing::debug!(runner = %entry.id, resolved = entry.is_resolved(), "service found");
        self.tree.set_endpoint(&entry.id, entry.endpoint.clone());
        self.services.insert(entry.id, entry.endpoint);
    }

    fn service_lost(&mut self, id: &RunnerId, now: Instant) {
        tracing::info!(runner = %id, "service lost");
        self.services.remove(id);
        if let Err(err) = self.tree.remove_runner(id) {
            tracing::warn!(runner = %id, error = %err, "failed to remove runner");
        }
        self.registry.lost_runner(id, now);
    }

    fn flush_lifecycle_events(&mut self) {
        for event in self.registry.drain_events() {
            if let Some(text) = event.status_message() {
                self.status_message(text);
            }
            match &event {
                LifecycleEvent::LoadFailed {
                    configuration,
                    reason,
                } => self.emit(MasterEvent::Alert {
                    title: format!("Failed to load {configuration}"),
                    text: reason.clone(),
                    hosts: Vec::new(),
                }),
                LifecycleEvent::LaunchFailed {
                    configuration,
                    missing,
                    hosts,
                    none_reported,
                } => self.emit(MasterEvent::Alert {
                    title: format!("Failed to start {configuration}"),
                    text: if *none_reported {
                        format!("No remote processes of {configuration} reported status.")
                    } else {
                        format!("Missing status from: {}", missing.join(", "))
                    },
                    hosts: hosts.clone(),
                }),
                LifecycleEvent::RunnersLost {
                    configuration,
                    missing,
                    hosts,
                } => {
                    self.emit(MasterEvent::Alert {
                        title: format!("{configuration} lost remote processes"),
                        text: format!("Lost status from: {}", missing.join(", ")),
                        hosts: hosts.clone(),
                    });
                    if self.config.lifecycle.auto_shutdown_on_loss {
                        let name = configuration.clone();
                        match self.shutdown_configuration(&name) {
                            Ok(text) => self.status_message(text),
                            Err(err) => self.status_message(err.to_string()),
                        }
                    }
                }
                _ => {}
            }
            self.emit(MasterEvent::Lifecycle(event));
        }
    }

    // -------------------------------------------------------------------------
    // Operator actions
    // -------------------------------------------------------------------------

    /// Carry out an operator action. `Ok` carries the status-bar text.
    pub fn perform(
        &mut self,
        action: OperatorAction,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> ActionResult {
        match action {
            OperatorAction::Load(path) => {
                let entry = self.registry.add(path);
                let name = entry.name().to_string();
                if let Some(err) = entry.error().cloned() {
                    return Err(err.into());
                }
                self.restart_disk_poller();
                Ok(format!("Loaded {name}."))
            }
            OperatorAction::Startup(name) => self.startup(&name, now),
            OperatorAction::Shutdown(name) => self.shutdown_configuration(&name),
            OperatorAction::ChangeState {
                configurations,
                state,
            } => {
                if self
                    .dispatcher
                    .post_state_change(&self.tree, &configurations, state)
                {
                    Ok(format!("Posted processing state change to {state}."))
                } else {
                    Err(OperatorError::PostFailed("processing state change"))
                }
            }
            OperatorAction::ClearStats(configurations) => {
                if self.dispatcher.post_clear_stats(&self.tree, &configurations) {
                    Ok("Posted clear stats request.".to_string())
                } else {
                    Err(OperatorError::PostFailed("clear stats"))
                }
            }
            OperatorAction::StartRecording => self.start_recording(wall),
            OperatorAction::StopRecording => self.stop_recording(false, wall),
            OperatorAction::DeleteRecording(name) => {
                self.recorder.delete(&name)?;
                Ok(format!("Deleted recording {name}."))
            }
            OperatorAction::UpdateNotes { name, notes } => {
                self.recorder.update_notes(&name, notes)?;
                Ok(String::new())
            }
            OperatorAction::SetDurationLimit(limit) => {
                self.recorder.set_duration_limit(limit);
                Ok(String::new())
            }
            OperatorAction::SetRecordable {
                configuration,
                recordable,
            } => {
                let entry = self
                    .registry
                    .get_mut(&configuration)
                    .ok_or(OperatorError::UnknownConfiguration(configuration))?;
                entry.set_recordable(recordable);
                Ok(String::new())
            }
            OperatorAction::Cleanup => self.cleanup(wall),
        }
    }

    fn startup(&mut self, name: &str, now: Instant) -> ActionResult {
        if self.registry.get(name).is_none() {
            return Err(OperatorError::UnknownConfiguration(name.to_string()));
        }
        let core_tx = self.core_tx.clone();
        let completion = LaunchCompletion::new(name, move |configuration, outcome| {
            let _ = core_tx.send(CoreMessage::LaunchDone {
                configuration: configuration.to_string(),
                outcome,
            });
        });
        let launcher = Arc::clone(&self.launcher);
        let entry = self
            .registry
            .get_mut(name)
            .ok_or_else(|| OperatorError::UnknownConfiguration(name.to_string()))?;
        entry.startup(launcher.as_ref(), completion, now)?;
        Ok(format!("Starting {name}..."))
    }

    fn shutdown_configuration(&mut self, name: &str) -> ActionResult {
        let entry = self
            .registry
            .get_mut(name)
            .ok_or_else(|| OperatorError::UnknownConfiguration(name.to_string()))?;
        entry.mark_shutting_down();
        tracing::info!(configuration = %name, "shutting down configuration");
        if self.dispatcher.post_shutdown(&self.tree, name) {
            Ok("Posted shutdown request.".to_string())
        } else {
            Err(OperatorError::PostFailed("shutdown"))
        }
    }

    fn start_recording(&mut self, wall: DateTime<Utc>) -> ActionResult {
        let names = self.registry.recordable_names();
        let targets = Targets {
            tree: &self.tree,
            registry: &self.registry,
            dispatcher: &self.dispatcher,
        };
        let name = self.recorder.start(&names, &targets, wall)?;
        self.registry.set_recording_state(&names, true);
        self.emit(MasterEvent::Recording(RecordingEvent::Started { name: name.clone() }));
        Ok(name)
    }

    fn stop_recording(&mut self, by_duration: bool, wall: DateTime<Utc>) -> ActionResult {
        let (name, names) = self.active_session();
        let targets = Targets {
            tree: &self.tree,
            registry: &self.registry,
            dispatcher: &self.dispatcher,
        };
        let result = self.recorder.stop(by_duration, &targets, wall);
        self.finish_stop(name, &names, by_duration, result)
    }

    /// Name and configurations of the active session, if any.
    fn active_session(&self) -> (Option<String>, Vec<String>) {
        self.recorder.active().map_or((None, Vec::new()), |session| {
            (Some(session.name.clone()), session.configuration_names.clone())
        })
    }

    /// Clear the recording overlay after `stop` ran. A session that was
    /// active is done even when its runners could not be told to stop.
    fn finish_stop(
        &mut self,
        name: Option<String>,
        names: &[String],
        by_duration: bool,
        result: Result<String, RecordingError>,
    ) -> ActionResult {
        if let Some(name) = name {
            self.registry.set_recording_state(names, false);
            self.emit(MasterEvent::Recording(RecordingEvent::Stopped {
                name,
                by_duration,
            }));
        }
        result.map_err(Into::into)
    }

    fn cleanup(&mut self, wall: DateTime<Utc>) -> ActionResult {
        if self.cleanup_running {
            return Ok("Cleanup already in progress.".to_string());
        }
        let (name, names) = self.active_session();
        let targets = Targets {
            tree: &self.tree,
            registry: &self.registry,
            dispatcher: &self.dispatcher,
        };
        self.recorder.reset(&targets, wall);
        let _ = self.finish_stop(name, &names, false, Ok(String::new()));
        for entry in self.registry.iter_mut() {
            entry.mark_shutting_down();
        }
        let hosts = self.registry.all_hosts();
        tracing::info!(hosts = hosts.len(), "starting cluster cleanup");
        spawn_cleanup(hosts, Arc::clone(&self.killer), self.worker_tx.clone())
            .map_err(OperatorError::Worker)?;
        self.cleanup_running = true;
        Ok("Cleaning up remote hosts...".to_string())
    }

    /// Answer a remote control request.
    pub fn handle_remote(&mut self, request: RemoteRequest, wall: DateTime<Utc>) -> RemoteReply {
        let result = match request {
            RemoteRequest::Start => self.start_recording(wall).map(Some),
            RemoteRequest::Stop => self.stop_recording(false, wall).map(|_| None),
        };
        self.flush_lifecycle_events();
        match result {
            Ok(detail) => RemoteReply::Ok(detail),
            Err(err) => {
                tracing::warn!(?request, error = %err, "remote control request failed");
                RemoteReply::Failed(err.to_string())
            }
        }
    }

    pub fn handle_worker(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::DiskUsage(usage) => {
                if self.registry.disk_usage(&usage) {
                    tracing::debug!(
                        root = %usage.root.display(),
                        free = %usage.free_text,
                        "disk usage updated"
                    );
                }
            }
            WorkerReport::HostCleaned { host, result } => match result {
                Ok(()) => self.status_message(format!("Cleaned up {host}.")),
                Err(err) => self.status_message(format!("Failed to clean up {host}: {err}")),
            },
            WorkerReport::CleanupFinished => {
                self.cleanup_running = false;
                for entry in self.registry.iter_mut() {
                    entry.force_not_running();
                }
                self.status_message("Cleanup finished.");
            }
        }
        self.flush_lifecycle_events();
    }

    // -------------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------------

    /// One-second tick: advance the recording clock and auto-stop at the
    /// duration limit.
    pub fn tick_now(&mut self, wall: DateTime<Utc>) {
        let (name, names) = self.active_session();
        if name.is_none() {
            return;
        }
        let targets = Targets {
            tree: &self.tree,
            registry: &self.registry,
            dispatcher: &self.dispatcher,
        };
        match self.recorder.tick(&targets, wall) {
            Some(result) => match self.finish_stop(name, &names, true, result) {
                Ok(name) => self.status_message(format!("Recording {name} reached its duration.")),
                Err(err) => self.status_message(err.to_string()),
            },
            None => {
                if let Some(session) = self.recorder.active() {
                    self.emit(MasterEvent::Recording(RecordingEvent::Progress {
                        name: session.name.clone(),
                        elapsed: session.elapsed.clone(),
                        remaining: session.remaining.clone(),
                        drop_count: session.drop_count,
                        dupe_count: session.dupe_count,
                    }));
                }
            }
        }
        self.flush_lifecycle_events();
    }

    /// Presence tick: startup deadlines and partial-loss confirmation.
    pub fn tick_presence(&mut self, now: Instant) {
        self.registry.poll(now);
        self.flush_lifecycle_events();
    }

    // -------------------------------------------------------------------------
    // Event loop
    // -------------------------------------------------------------------------

    /// Run until [`CoreMessage::Shutdown`]. `remote` carries requests from the
    /// remote control listener, when one is running.
    pub async fn run(mut self, remote: Option<mpsc::Receiver<RemoteCommand>>) {
        let (Some(mut core_rx), Some(mut worker_rx)) = (self.core_rx.take(), self.worker_rx.take())
        else {
            tracing::error!("master event loop already ran");
            return;
        };
        let mut remote = remote;

        let mut now_tick = tokio::time::interval(NOW_TICK);
        now_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut presence_tick = tokio::time::interval(self.config.lifecycle.presence_tick());
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(configurations = self.registry.len(), "master running");
        loop {
            tokio::select! {
                message = core_rx.recv() => {
                    let Some(message) = message else { break };
                    if !self.handle_message(message, Instant::now()) {
                        break;
                    }
                }
                Some(report) = worker_rx.recv() => self.handle_worker(report),
                Some(command) = recv_remote(&mut remote) => {
                    let reply = self.handle_remote(command.request, Utc::now());
                    let _ = command.reply.send(reply);
                }
                _ = now_tick.tick() => self.tick_now(Utc::now()),
                _ = presence_tick.tick() => self.tick_presence(Instant::now()),
            }
        }

        if let Some(poller) = self.disk_poller.take() {
            poller.stop();
        }
        tracing::info!("master stopped");
    }
}

async fn recv_remote(remote: &mut Option<mpsc::Receiver<RemoteCommand>>) -> Option<RemoteCommand> {
    match remote {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Status ingest
// =============================================================================

/// Receive status datagrams and forward decoded records to the core loop.
/// Returns when the core loop has gone away.
pub async fn collect_status(socket: UdpSocket, max_datagram_bytes: usize, handle: MasterHandle) {
    let mut buf = vec![0u8; max_datagram_bytes];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                tracing::warn!(error = %err, "status receive failed");
                continue;
            }
        };
        match decode_status(&buf[..len]) {
            Ok(status) => {
                if !handle.send(CoreMessage::Status(status)) {
                    return;
                }
            }
            Err(err @ StatusError::VersionMismatch { .. }) => {
                tracing::debug!(%peer, error = %err, "discarding status with wrong version");
            }
            Err(err) => {
                tracing::debug!(%peer, error = %err, "discarding undecodable status");
            }
        }
    }
}
