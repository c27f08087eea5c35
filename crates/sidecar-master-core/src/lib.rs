//! sidecar-master-core: control-plane core of the SideCar cluster master
//!
//! The master supervises radar-processing runners spread over a cluster. It
//! keeps a live model of every runner's pipeline, launches and watches
//! configurations, commands runners, and runs multi-host recording sessions.
//!
//! # Architecture
//!
//! ```text
//! status datagrams → StatusTree (+ stats rollup) → ConfigurationRegistry → events
//!                                                          ↑
//! operator / remote control → Master loop → CommandDispatcher → runners
//!                                       ↓
//!                               RecordingController → recordings directories
//! ```
//!
//! # Modules
//!
//! - `status`: inbound status records and runner identity
//! - `processing_state`: runner processing states
//! - `stats`: per-node statistics and their merge rules
//! - `tree`: arena-backed status tree with bottom-up aggregation
//! - `loader`: configuration XML loading and validation
//! - `lifecycle`: per-configuration load/startup/presence state machine
//! - `launcher`, `discovery`: collaborator seams for spawning and finding runners
//! - `dispatch`: command fan-out to runner endpoints
//! - `recording`: recording sessions, sidecar notes files, restore
//! - `remote_control`: line-oriented TCP start/stop listener
//! - `workers`: disk-space poller and host cleanup threads
//! - `master`: the core event loop tying everything together
//! - `config`, `logging`, `error`: ambient configuration, tracing setup, errors
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod error;
pub mod launcher;
pub mod lifecycle;
pub mod loader;
pub mod logging;
pub mod master;
pub mod processing_state;
pub mod recording;
pub mod remote_control;
pub mod stats;
pub mod status;
pub mod tree;
pub mod workers;

pub use config::Config;
pub use error::{Error, Result};
pub use master::{Collaborators, CoreMessage, Master, MasterEvent, MasterHandle, OperatorAction};
