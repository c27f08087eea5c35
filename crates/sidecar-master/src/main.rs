//! scm - SideCar cluster master CLI
//!
//! Thin wrapper over `sidecar-master-core`: runs the master event loop and
//! offers a few offline helpers for configuration files and recordings.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, anyhow, bail};
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use sidecar_master_core::discovery::StaticDiscovery;
use sidecar_master_core::dispatch::JsonRpcClient;
use sidecar_master_core::launcher::ExternalLauncher;
use sidecar_master_core::lifecycle::recording_directory_problem;
use sidecar_master_core::loader::load_configuration;
use sidecar_master_core::logging::{LogFormat, init_logging};
use sidecar_master_core::master::collect_status;
use sidecar_master_core::recording::{RecordingController, Sidecar};
use sidecar_master_core::remote_control::RemoteControlServer;
use sidecar_master_core::workers::CommandHostKiller;
use sidecar_master_core::{Collaborators, Config, CoreMessage, Error, Master, MasterEvent};

#[derive(Parser)]
#[command(name = "scm")]
#[command(about = "SideCar cluster master", long_about = None)]
#[command(version)]
struct Cli {
    /// Master config file (defaults to the user config directory)
    #[arg(long, global = true, env = "SCM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override the configured log format (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the master until interrupted
    Run,

    /// Load configuration files and report whether they are usable
    Check {
        /// Configuration XML files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// List recording sessions found under the recordings roots
    Sessions {
        /// Recordings root to scan; repeatable. Defaults to the configured roots.
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        /// Day to list (YYYY-MM-DD); defaults to today
        #[arg(long)]
        date: Option<NaiveDate>,

        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print a recording notes file
    Notes {
        file: PathBuf,

        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err.downcast_ref::<Error>().and_then(Error::remediation) {
                eprintln!();
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path).map_err(Error::from)?,
        None => Config::load().map_err(Error::from)?,
    };

    let mut log_config = config.general.log_config();
    if let Some(level) = cli.log_level {
        log_config.level = level;
    }
    if let Some(format) = cli.log_format {
        log_config.format = format;
    }
    init_logging(&log_config).map_err(Error::from)?;

    match cli.command {
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(run_master(config))
        }
        Commands::Check { files } => check(&files),
        Commands::Sessions { roots, date, json } => sessions(&config, roots, date, json),
        Commands::Notes { file, json } => notes(&file, json),
    }
}

// =============================================================================
// run
// =============================================================================

async fn run_master(config: Config) -> anyhow::Result<()> {
    let collaborators = Collaborators {
        launcher: Arc::new(ExternalLauncher),
        rpc: Arc::new(JsonRpcClient::new(
            config.dispatch.connect_timeout(),
            config.dispatch.call_timeout(),
        )),
        killer: Arc::new(CommandHostKiller::new(config.cleanup.command.clone())),
    };
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let mut master = Master::new(config.clone(), collaborators, event_tx);
    let handle = master.handle();

    master.load_configurations(Local::now().date_naive());
    for entry in StaticDiscovery::from_config(&config.discovery).entries() {
        handle.send(CoreMessage::ServiceFound(entry.clone()));
    }

    let socket = UdpSocket::bind(&config.ingest.status_bind)
        .await
        .with_context(|| format!("Failed to bind status socket {}", config.ingest.status_bind))?;
    tracing::info!(bind = %config.ingest.status_bind, "listening for runner status");
    let ingest = tokio::spawn(collect_status(
        socket,
        config.ingest.max_datagram_bytes,
        handle.clone(),
    ));

    let listener_shutdown = Arc::new(AtomicBool::new(false));
    let remote_rx = if config.remote_control.enabled {
        match RemoteControlServer::bind(&config.remote_control.bind).await {
            Ok(server) => {
                let (remote_tx, remote_rx) = mpsc::channel(16);
                tokio::spawn(server.run(remote_tx, Arc::clone(&listener_shutdown)));
                Some(remote_rx)
            }
            Err(err) => {
                tracing::warn!(
                    bind = %config.remote_control.bind,
                    error = %err,
                    "remote control disabled: bind failed"
                );
                None
            }
        }
    } else {
        None
    };

    tokio::spawn(log_events(event_rx));

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            interrupt.shutdown();
        }
    });

    let result = tokio::spawn(master.run(remote_rx)).await;
    listener_shutdown.store(true, Ordering::SeqCst);
    ingest.abort();
    result.map_err(|err| Error::Runtime(format!("master loop failed: {err}")))?;
    Ok(())
}

async fn log_events(mut events: mpsc::UnboundedReceiver<MasterEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            MasterEvent::StatusMessage { text } => tracing::info!("{text}"),
            MasterEvent::Alert { title, text, hosts } => {
                tracing::warn!(title = %title, hosts = ?hosts, "{text}");
            }
            MasterEvent::Lifecycle(event) => {
                tracing::debug!(configuration = event.configuration(), ?event, "lifecycle event");
            }
            MasterEvent::Recording(event) => tracing::debug!(?event, "recording event"),
        }
    }
}

// =============================================================================
// check
// =============================================================================

fn check(files: &[PathBuf]) -> anyhow::Result<()> {
    let mut failed = 0usize;
    for path in files {
        match load_configuration(path) {
            Ok(loaded) => {
                println!(
                    "{}: OK ({}, {} runners on {} hosts)",
                    path.display(),
                    loaded.name,
                    loaded.runners.len(),
                    loaded.host_names.len()
                );
                if let Some(problem) = recording_directory_problem(&loaded.recordings_directory) {
                    println!(
                        "  warning: recordings directory {} {problem}",
                        loaded.recordings_directory.display()
                    );
                }
            }
            Err(err) => {
                failed += 1;
                println!("{}: {err}", path.display());
                if let Some(remediation) = Error::from(err).remediation() {
                    for line in remediation.render_plain().lines() {
                        println!("  {line}");
                    }
                }
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} configuration files failed to load", files.len());
    }
    Ok(())
}

// =============================================================================
// sessions
// =============================================================================

fn sessions(
    config: &Config,
    roots: Vec<PathBuf>,
    date: Option<NaiveDate>,
    json: bool,
) -> anyhow::Result<()> {
    let roots = if roots.is_empty() {
        configured_roots(config)
    } else {
        roots
    };
    if roots.is_empty() {
        return Err(anyhow!("No recordings roots configured; pass --root"));
    }

    let day = date.unwrap_or_else(|| Local::now().date_naive());
    let mut controller = RecordingController::new(config.recording.initial_sequence);
    let unreadable = controller.restore(&roots, day);

    if json {
        let out = serde_json::to_string_pretty(controller.sessions())
            .context("Failed to serialize sessions")?;
        println!("{out}");
        return Ok(());
    }

    if controller.sessions().is_empty() {
        println!("No recordings for {day}.");
        return Ok(());
    }
    println!(
        "{:<24} {:>9} {:>8} {:>8}  CONFIGURATIONS",
        "NAME", "DURATION", "DROPS", "DUPES"
    );
    for session in controller.sessions() {
        println!(
            "{:<24} {:>9} {:>8} {:>8}  {}",
            session.name,
            session.elapsed,
            session.drop_count,
            session.dupe_count,
            session.configuration_names.join(" ")
        );
    }
    if !unreadable.is_empty() {
        println!();
        println!("Notes missing or unreadable: {}", unreadable.join(", "));
    }
    println!("Next sequence number: {}", controller.next_sequence());
    Ok(())
}

/// Roots from the master config plus the recordings directory of every
/// configuration it names.
fn configured_roots(config: &Config) -> Vec<PathBuf> {
    let mut roots = config.recording.recordings_roots.clone();
    for path in &config.configurations {
        match load_configuration(path) {
            Ok(loaded) => {
                if !roots.contains(&loaded.recordings_directory) {
                    roots.push(loaded.recordings_directory);
                }
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping configuration");
            }
        }
    }
    roots
}

// =============================================================================
// notes
// =============================================================================

fn notes(path: &Path, json: bool) -> anyhow::Result<()> {
    let text = std::fs::read_to_string(path)
        .map_err(Error::from)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let Some(sidecar) = Sidecar::parse(&text) else {
        bail!("{} is not a recording notes file", path.display());
    };

    if json {
        let out = serde_json::to_string_pretty(&sidecar).context("Failed to serialize notes")?;
        println!("{out}");
        return Ok(());
    }

    println!("Configurations: {}", sidecar.configurations.join(", "));
    println!("Duration:       {}", sidecar.duration);
    println!("Dropped:        {}", sidecar.drop_count);
    println!("Duplicates:     {}", sidecar.dupe_count);
    let radar = &sidecar.notes;
    match radar.radar_transmitting {
        Some(frequency) => println!("Transmitting:   yes, {frequency} MHz"),
        None => println!("Transmitting:   no"),
    }
    match radar.radar_rotating {
        Some(rate) => println!("Rotating:       yes, {rate} rpm"),
        None => println!("Rotating:       no"),
    }
    match &radar.drfm {
        Some(drfm) => println!("DRFM:           {drfm}"),
        None => println!("DRFM:           no"),
    }
    if !radar.text.is_empty() {
        println!();
        print!("{}", radar.text);
    }
    Ok(())
}
