//! Library and application errors

use std::{
    fmt::{Display, Formatter},
    io,
    path::PathBuf,
};

use miette::Diagnostic;
use thiserror::Error;

use crate::session::OperationKind;

/// All possible errors returned by hexflash
#[derive(Debug, Diagnostic, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("An exclusive {0} operation is already in progress")]
    #[diagnostic(
        code(hexflash::already_in_progress),
        help("Wait for the running operation to finish before starting another one")
    )]
    AlreadyInProgress(OperationKind),

    #[error("A serial port is already connected")]
    #[diagnostic(
        code(hexflash::already_connected),
        help("Disconnect from the current port first")
    )]
    AlreadyConnected,

    #[error("Operation was cancelled by the user")]
    #[diagnostic(code(hexflash::cancelled))]
    Cancelled,

    #[error("Failed to write configuration to {path}")]
    #[diagnostic(code(hexflash::config))]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[cfg(feature = "cli")]
    #[error(transparent)]
    #[diagnostic(code(hexflash::dialoguer_error))]
    DialoguerError(#[from] dialoguer::Error),

    #[error("Incorrect password")]
    #[diagnostic(code(hexflash::invalid_password))]
    InvalidPassword,

    #[error(transparent)]
    #[diagnostic(code(hexflash::io_error))]
    Io(#[from] io::Error),

    #[error("Missing required file(s): {0}")]
    #[diagnostic(
        code(hexflash::missing_file),
        help("The bootloader and partition table are expected next to the application")
    )]
    MissingFile(MissingFiles),

    #[error("Firmware server request failed: {0}")]
    #[diagnostic(
        code(hexflash::network),
        help("Check the configured API host with `hexflash host`")
    )]
    Network(String),

    #[error("No serial ports could be detected")]
    #[diagnostic(
        code(hexflash::no_serial),
        help("Make sure the correct device is connected to the host system")
    )]
    NoSerial,

    #[error("No flash or erase operation is running")]
    #[diagnostic(code(hexflash::no_operation))]
    NoOperation,

    #[error("No serial port is connected")]
    #[diagnostic(code(hexflash::not_connected))]
    NotConnected,

    #[error("Log is empty, nothing to export")]
    #[diagnostic(code(hexflash::nothing_to_export))]
    NothingToExport,

    #[error("Cannot do this while an exclusive operation is in progress")]
    #[diagnostic(
        code(hexflash::operation_in_progress),
        help("Wait for the flash or erase operation to complete or fail first")
    )]
    OperationInProgress,

    #[error("The serial port '{port}' could not be opened")]
    #[diagnostic(
        code(hexflash::port_unavailable),
        help("Make sure the device is connected and not in use by another program")
    )]
    PortUnavailable {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Serial port {port} did not come back after the flashing tool ran ({outcome})")]
    #[diagnostic(
        code(hexflash::port_not_reacquired),
        help("Reconnect the device and check whether the last operation completed")
    )]
    PortNotReacquired {
        port: String,
        /// How the tool itself finished
        outcome: String,
        #[source]
        source: Box<Error>,
    },

    #[error("The serial port '{0}' could not be found")]
    #[diagnostic(
        code(hexflash::serial_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    SerialNotFound(String),

    #[error("Flashing tool exited with code {code}")]
    #[diagnostic(code(hexflash::tool_failed))]
    ToolFailed { code: i32 },

    #[error("Flashing tool '{program}' could not be started")]
    #[diagnostic(
        code(hexflash::tool_unavailable),
        help("Install the tool or point `--tool` at its location")
    )]
    ToolUnavailable {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Unknown configuration key '{0}'")]
    #[diagnostic(code(hexflash::unknown_config_key), help("The only recognized key is 'host'"))]
    UnknownConfigKey(String),

    #[error("The running {0} operation cannot be interrupted")]
    #[diagnostic(
        code(hexflash::unsupported),
        help("The operation keeps running in the background until it finishes")
    )]
    Unsupported(OperationKind),
}

impl Error {
    /// Whether this error means the serial device itself has gone away
    ///
    /// Timeouts and interruptions leave the port usable and are not fatal.
    pub fn is_fatal_io(&self) -> bool {
        match self {
            Error::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Network(err.to_string())
    }
}

/// Names of every required file that could not be found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingFiles(pub Vec<String>);

impl MissingFiles {
    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl Display for MissingFiles {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join(", "))
    }
}
