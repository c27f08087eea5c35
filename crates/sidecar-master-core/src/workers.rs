//! Auxiliary worker threads.
//!
//! Both workers do blocking I/O on their own thread and only talk back to the
//! core loop through [`WorkerReport`] messages. Neither sees the status tree.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use humansize::{BINARY, format_size};
use tokio::sync::mpsc;

use crate::lifecycle::DiskUsage;

/// Placeholder replaced by the host name in cleanup command templates.
pub const HOST_PLACEHOLDER: &str = "{host}";

#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    DiskUsage(DiskUsage),
    HostCleaned {
        host: String,
        result: Result<(), String>,
    },
    CleanupFinished,
}

// =============================================================================
// Disk space
// =============================================================================

/// Capacity of the filesystem holding `root`.
pub fn sample_disk_usage(root: &Path) -> std::io::Result<DiskUsage> {
    let total_bytes = fs2::total_space(root)?;
    let available_bytes = fs2::available_space(root)?;
    #[allow(clippy::cast_precision_loss)]
    let percent_used = if total_bytes == 0 {
        0.0
    } else {
        100.0 * (total_bytes.saturating_sub(available_bytes)) as f64 / total_bytes as f64
    };
    Ok(DiskUsage {
        root: root.to_path_buf(),
        total_bytes,
        available_bytes,
        percent_used,
        free_text: format_size(available_bytes, BINARY),
    })
}

/// Periodically samples each recordings root. Dropping the poller stops the
/// thread without waiting for it.
#[derive(Debug)]
pub struct DiskSpacePoller {
    stop_tx: std_mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl DiskSpacePoller {
    pub fn spawn(
        roots: Vec<PathBuf>,
        interval: Duration,
        warning_percent: u8,
        report_tx: mpsc::UnboundedSender<WorkerReport>,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("scm-disk-space".to_string())
            .spawn(move || {
                loop {
                    for root in &roots {
                        match sample_disk_usage(root) {
                            Ok(usage) => {
                                if usage.percent_used >= f64::from(warning_percent) {
                                    tracing::warn!(
                                        root = %root.display(),
                                        percent_used = usage.percent_used,
                                        free = %usage.free_text,
                                        "recordings filesystem nearly full"
                                    );
                                }
                                if report_tx.send(WorkerReport::DiskUsage(usage)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                tracing::debug!(root = %root.display(), error = %err, "disk space check failed");
                            }
                        }
                    }
                    match stop_rx.recv_timeout(interval) {
                        Err(std_mpsc::RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
                    }
                }
            })?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiskSpacePoller {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}

// =============================================================================
// Host cleanup
// =============================================================================

/// Kills every runner process on a host. Blocking.
pub trait HostKiller: Send + Sync {
    fn kill(&self, host: &str) -> Result<(), String>;
}

/// Runs a configured argv template once per host.
#[derive(Debug, Clone, Default)]
pub struct CommandHostKiller {
    template: Vec<String>,
}

impl CommandHostKiller {
    #[must_use]
    pub const fn new(template: Vec<String>) -> Self {
        Self { template }
    }

    #[must_use]
    pub fn argv(&self, host: &str) -> Vec<String> {
        self.template
            .iter()
            .map(|arg| arg.replace(HOST_PLACEHOLDER, host))
            .collect()
    }
}

impl HostKiller for CommandHostKiller {
    fn kill(&self, host: &str) -> Result<(), String> {
        let argv = self.argv(host);
        let Some((program, args)) = argv.split_first() else {
            tracing::info!(host, "no cleanup command configured");
            return Ok(());
        };
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| format!("failed to run {program}: {err}"))?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(format!("{program} exited with {}: {}", output.status, stderr.trim()))
        }
    }
}

/// Clean each host in turn on a dedicated thread, reporting one host at a
/// time and then [`WorkerReport::CleanupFinished`].
pub fn spawn_cleanup(
    hosts: Vec<String>,
    killer: Arc<dyn HostKiller>,
    report_tx: mpsc::UnboundedSender<WorkerReport>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("scm-cleanup".to_string())
        .spawn(move || {
            for host in hosts {
                tracing::info!(host = %host, "cleaning up host");
                let result = killer.kill(&host);
                if let Err(err) = &result {
                    tracing::warn!(host = %host, error = %err, "host cleanup failed");
                }
                if report_tx.send(WorkerReport::HostCleaned { host, result }).is_err() {
                    return;
                }
            }
            let _ = report_tx.send(WorkerReport::CleanupFinished);
        })
}
