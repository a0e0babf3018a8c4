//! Serial session management and flashing for ESP32 devices
//!
//! A single serial connection is shared between a live monitor and exclusive
//! flash or erase operations. The [SessionManager] guarantees that at most one
//! of them touches the port at any moment, the [Orchestrator] runs operations
//! in the background, and everything the user should see ends up in the
//! [LogSink].

pub mod capability;
pub mod config;
pub mod connection;
pub mod firmware;
pub mod log_sink;
pub mod monitor;
pub mod operation;
pub mod progress;
pub mod session;

#[cfg(feature = "cli")]
pub mod cli;

mod error;

pub use crate::{
    capability::{ExternalTool, FlashCapability, ToolFlavor},
    config::ConfigStore,
    error::{Error, MissingFiles},
    log_sink::LogSink,
    operation::{Operation, OperationRequest, OperationStatus, Orchestrator},
    session::{OperationKind, SessionManager, SessionState},
};
