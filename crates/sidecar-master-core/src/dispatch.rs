//! Command fan-out to runner command endpoints.
//!
//! Commands are addressed by configuration name. Every runner under a matching
//! configuration with a resolved endpoint gets its own call; one failing runner
//! never stops the rest. The caller only sees an aggregate success flag.

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};

use crate::discovery::Endpoint;
use crate::processing_state::ProcessingState;
use crate::tree::{NodeId, StatusTree};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error talking to {endpoint}: {source}")]
    Io {
        endpoint: Endpoint,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed reply from {endpoint}: {reason}")]
    Malformed { endpoint: Endpoint, reason: String },

    #[error("{endpoint} rejected '{verb}': {message}")]
    Remote {
        endpoint: Endpoint,
        verb: String,
        message: String,
    },

    #[error("no configuration named '{0}' is reporting")]
    UnknownConfiguration(String),
}

/// Commands understood by runners.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StateChange(ProcessingState),
    ClearStats,
    /// Start recording into the given directory, or stop when empty.
    RecordingChange(String),
    Shutdown,
    GetParameters { stream: usize, task: usize },
    SetParameters {
        stream: usize,
        task: usize,
        updates: Value,
    },
    GetChangedParameters,
}

impl Command {
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::StateChange(_) => "stateChange",
            Self::ClearStats => "clearStats",
            Self::RecordingChange(_) => "recordingChange",
            Self::Shutdown => "shutdown",
            Self::GetParameters { .. } => "getParameters",
            Self::SetParameters { .. } => "setParameters",
            Self::GetChangedParameters => "getChangedParameters",
        }
    }

    #[must_use]
    pub fn args(&self) -> Vec<Value> {
        match self {
            Self::StateChange(state) => vec![json!(state.wire_value())],
            Self::RecordingChange(path) => vec![json!(path)],
            Self::GetParameters { stream, task } => vec![json!(stream), json!(task)],
            Self::SetParameters {
                stream,
                task,
                updates,
            } => vec![json!(stream), json!(task), updates.clone()],
            Self::ClearStats | Self::Shutdown | Self::GetChangedParameters => Vec::new(),
        }
    }
}

/// Synchronous request/response transport to one runner.
pub trait RpcClient: Send + Sync {
    fn call(&self, endpoint: &Endpoint, verb: &str, args: &[Value]) -> Result<Value, DispatchError>;
}

// =============================================================================
// JSON-lines transport
// =============================================================================

/// Newline-delimited JSON request/response over TCP.
///
/// Request: `{"id": n, "method": verb, "params": [...]}`. Reply: one line with
/// either `result` or `error`. Every call opens its own connection; both the
/// connect and the exchange are bounded by timeouts.
#[derive(Debug)]
pub struct JsonRpcClient {
    connect_timeout: Duration,
    call_timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    #[must_use]
    pub const fn new(connect_timeout: Duration, call_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            call_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    fn connect(&self, endpoint: &Endpoint) -> Result<TcpStream, DispatchError> {
        let connect_err = |source| DispatchError::Connect {
            endpoint: endpoint.clone(),
            source,
        };
        let addrs = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()
            .map_err(connect_err)?;
        let mut last = std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses resolved");
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => last = err,
            }
        }
        Err(connect_err(last))
    }
}

impl Default for JsonRpcClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(10))
    }
}

impl RpcClient for JsonRpcClient {
    fn call(&self, endpoint: &Endpoint, verb: &str, args: &[Value]) -> Result<Value, DispatchError> {
        let io_err = |source| DispatchError::Io {
            endpoint: endpoint.clone(),
            source,
        };
        let stream = self.connect(endpoint)?;
        stream
            .set_read_timeout(Some(self.call_timeout))
            .map_err(io_err)?;
        stream
            .set_write_timeout(Some(self.call_timeout))
            .map_err(io_err)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut line = json!({ "id": id, "method": verb, "params": args }).to_string();
        line.push('\n');
        let mut writer = &stream;
        writer.write_all(line.as_bytes()).map_err(io_err)?;
        writer.flush().map_err(io_err)?;

        let mut reply = String::new();
        BufReader::new(&stream)
            .read_line(&mut reply)
            .map_err(io_err)?;
        let reply: Value = serde_json::from_str(reply.trim()).map_err(|err| {
            DispatchError::Malformed {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            }
        })?;

        if let Some(error) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(DispatchError::Remote {
                endpoint: endpoint.clone(),
                verb: verb.to_string(),
                message: error
                    .as_str()
                    .map_or_else(|| error.to_string(), str::to_string),
            });
        }
        reply
            .get("result")
            .cloned()
            .ok_or_else(|| DispatchError::Malformed {
                endpoint: endpoint.clone(),
                reason: "reply has neither result nor error".to_string(),
            })
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Deviations from startup parameter values, formatted for recording notes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangedParameters {
    pub lines: Vec<String>,
    /// False if any runner could not be asked.
    pub complete: bool,
}

#[derive(Clone)]
pub struct CommandDispatcher {
    client: Arc<dyn RpcClient>,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher").finish_non_exhaustive()
    }
}

impl CommandDispatcher {
    #[must_use]
    pub fn new(client: Arc<dyn RpcClient>) -> Self {
        Self { client }
    }

    /// Runner nodes of a configuration, or `None` if it is not in the tree.
    fn runners(tree: &StatusTree, configuration: &str) -> Option<Vec<NodeId>> {
        tree.configuration(configuration)
            .map(|_| tree.runners_of(configuration))
    }

    fn call_runner(
        &self,
        tree: &StatusTree,
        runner: NodeId,
        command: &Command,
    ) -> Option<Result<Value, DispatchError>> {
        let node = tree.runner(runner)?;
        let Some(endpoint) = &node.endpoint else {
            tracing::error!(
                service = %node.id,
                host = %node.id.host,
                verb = command.verb(),
                "unresolved runner, command skipped"
            );
            return None;
        };
        tracing::info!(
            service = %node.id,
            endpoint = %endpoint,
            verb = command.verb(),
            "posting command"
        );
        Some(self.client.call(endpoint, command.verb(), &command.args()))
    }

    /// Send `command` to one configuration's runners.
    pub fn post_to_configuration(
        &self,
        tree: &StatusTree,
        configuration: &str,
        command: &Command,
    ) -> bool {
        let Some(runners) = Self::runners(tree, configuration) else {
            tracing::warn!(
                configuration,
                verb = command.verb(),
                error = %DispatchError::UnknownConfiguration(configuration.to_string()),
                "command not posted"
            );
            return false;
        };
        let mut ok = true;
        for runner in runners {
            if let Some(Err(err)) = self.call_runner(tree, runner, command) {
                tracing::error!(configuration, verb = command.verb(), error = %err, "command failed");
                ok = false;
            }
        }
        ok
    }

    /// Send `command` to every runner of every configuration in `filter`.
    pub fn post_command(&self, tree: &StatusTree, filter: &[String], command: &Command) -> bool {
        let mut ok = true;
        for configuration in filter {
            ok &= self.post_to_configuration(tree, configuration, command);
        }
        ok
    }

    pub fn post_state_change(
        &self,
        tree: &StatusTree,
        filter: &[String],
        state: ProcessingState,
    ) -> bool {
        tracing::info!(state = %state, "posting processing state change");
        self.post_command(tree, filter, &Command::StateChange(state))
    }

    pub fn post_clear_stats(&self, tree: &StatusTree, filter: &[String]) -> bool {
        self.post_command(tree, filter, &Command::ClearStats)
    }

    /// Tell each configuration where to record. Stops at the first
    /// configuration that fails.
    pub fn post_recording_start(&self, tree: &StatusTree, targets: &[(String, PathBuf)]) -> bool {
        targets.iter().all(|(configuration, path)| {
            let command = Command::RecordingChange(path.to_string_lossy().into_owned());
            self.post_to_configuration(tree, configuration, &command)
        })
    }

    pub fn post_recording_stop(&self, tree: &StatusTree, filter: &[String]) -> bool {
        self.post_command(tree, filter, &Command::RecordingChange(String::new()))
    }

    pub fn post_shutdown(&self, tree: &StatusTree, configuration: &str) -> bool {
        self.post_to_configuration(tree, configuration, &Command::Shutdown)
    }

    /// Parameter definitions of one controller.
    pub fn get_parameters(
        &self,
        tree: &StatusTree,
        runner: NodeId,
        stream: usize,
        task: usize,
    ) -> Option<Result<Value, DispatchError>> {
        self.call_runner(tree, runner, &Command::GetParameters { stream, task })
    }

    pub fn set_parameters(
        &self,
        tree: &StatusTree,
        runner: NodeId,
        stream: usize,
        task: usize,
        updates: Value,
    ) -> Option<Result<Value, DispatchError>> {
        self.call_runner(
            tree,
            runner,
            &Command::SetParameters {
                stream,
                task,
                updates,
            },
        )
    }

    /// Collect parameter deviations for every runner of the named
    /// configurations. Unknown configurations are skipped.
    pub fn changed_parameters(&self, tree: &StatusTree, filter: &[String]) -> ChangedParameters {
        let mut changes = ChangedParameters {
            lines: Vec::new(),
            complete: true,
        };
        for configuration in filter {
            for runner in tree.runners_of(configuration) {
                match self.call_runner(tree, runner, &Command::GetChangedParameters) {
                    None => {}
                    Some(Err(err)) => {
                        tracing::error!(configuration = %configuration, error = %err, "failed to fetch changed parameters");
                        changes
                            .lines
                            .push("*** failed RPC for changed parameters ***\n".to_string());
                        changes.complete = false;
                    }
                    Some(Ok(result)) => format_runner_changes(tree, runner, &result, &mut changes.lines),
                }
            }
        }
        changes
    }
}

// =============================================================================
// Parameter change formatting
// =============================================================================

/// `result[stream][task]` holds the changed parameter definitions of each task.
fn format_runner_changes(tree: &StatusTree, runner: NodeId, result: &Value, out: &mut Vec<String>) {
    let stream_count = tree.children(runner).len();
    for stream_slot in 0..stream_count {
        let Some(stream) = tree.stream_by_slot(runner, stream_slot) else {
            continue;
        };
        let Some(per_task) = result.get(stream_slot).and_then(Value::as_array) else {
            continue;
        };
        for (task_slot, definitions) in per_task.iter().enumerate() {
            let Some(task) = tree.task_by_slot(stream, task_slot) else {
                continue;
            };
            let heading = format!(
                "* Path: {}\n",
                tree.path_names(task)
                    .iter()
                    .map(|name| format!("'{name}'"))
                    .collect::<Vec<_>>()
                    .join(" -> ")
            );
            format_task_changes(&heading, definitions, out);
        }
    }
}

fn format_task_changes(heading: &str, definitions: &Value, out: &mut Vec<String>) {
    let Some(definitions) = definitions.as_array() else {
        return;
    };
    let mut wrote_heading = false;
    for definition in definitions {
        let Some((value, original)) = format_definition(definition) else {
            continue;
        };
        if !wrote_heading {
            out.push(heading.to_string());
            wrote_heading = true;
        }
        let name = definition.get("name").and_then(Value::as_str).unwrap_or_default();
        out.push(format!("  Param '{name}' = {value}  [original is {original}]\n"));
    }
}

/// Render the current and original value of one definition. Notifications
/// carry no value and yield `None`.
fn format_definition(definition: &Value) -> Option<(String, String)> {
    let kind = definition.get("type").and_then(Value::as_str).unwrap_or_default();
    let render = |key: &str| -> String {
        let value = definition.get(key).unwrap_or(&Value::Null);
        match kind {
            "int" => value.as_i64().unwrap_or_default().to_string(),
            "double" => value.as_f64().unwrap_or_default().to_string(),
            "bool" => if value.as_bool().unwrap_or_default() { "TRUE" } else { "FALSE" }.to_string(),
            "enum" => {
                let min = definition.get("min").and_then(Value::as_i64).unwrap_or_default();
                let names = definition
                    .get("enumNames")
                    .and_then(Value::as_array)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                value
                    .as_i64()
                    .and_then(|v| usize::try_from(v - min).ok())
                    .and_then(|index| names.get(index))
                    .and_then(Value::as_str)
                    .map(|name| format!("'{name}'"))
                    .unwrap_or_default()
            }
            _ => format!("'{}'", value.as_str().unwrap_or_default()),
        }
    };
    if kind == "notification" {
        return None;
    }
    Some((render("value"), render("original")))
}
