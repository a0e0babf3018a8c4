//! Flash and erase operations
//!
//! The [Orchestrator] runs at most one flash or erase at a time on a worker
//! thread. Preconditions are checked before the port is touched: a wrong
//! password or a missing image never disturbs the monitor. Progress lines are
//! appended to the [LogSink] as the flashing tool produces them.
//!
//! Failed operations are never retried automatically.

use std::{
    env,
    fmt::{Display, Formatter},
    io::{self, ErrorKind},
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex, MutexGuard,
    },
    thread,
};

use log::{debug, info, warn};

use crate::{
    capability::{CancelToken, FlashCapability, FlashImages},
    error::{Error, MissingFiles},
    log_sink::LogSink,
    progress::ProgressCallbacks,
    session::{OperationKind, PortLease, SessionManager},
};

/// Password guarding flash and erase.
///
/// A single shared literal, not scoped to a user or a device.
pub const FLASH_PASSWORD: &str = "qwertyuiop";

/// File name of the bundled second stage bootloader
pub const BOOTLOADER_FILE: &str = "bootloader.bin";
/// File name of the bundled partition table
pub const PARTITION_TABLE_FILE: &str = "partitions.bin";

/// Lifecycle of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Running,
    Succeeded,
    Failed {
        reason: String,
        /// Last line the flashing tool printed before failing
        last_line: Option<String>,
    },
    Cancelled,
}

impl OperationStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            OperationStatus::Succeeded | OperationStatus::Failed { .. } | OperationStatus::Cancelled
        )
    }
}

impl Display for OperationStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationStatus::Pending => write!(f, "pending"),
            OperationStatus::Running => write!(f, "running"),
            OperationStatus::Succeeded => write!(f, "succeeded"),
            OperationStatus::Failed {
                reason,
                last_line: Some(line),
            } => write!(f, "failed: {reason} (last output: {line})"),
            OperationStatus::Failed { reason, .. } => write!(f, "failed: {reason}"),
            OperationStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelState {
    NotRequested,
    /// Asked for, the operation has not stopped (yet)
    Requested,
    /// The operation stopped because it was asked to
    Confirmed,
}

/// Images for a flash operation
///
/// The firmware is optional here so that "nothing selected" is reported along
/// with any other missing file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashFiles {
    pub firmware: Option<PathBuf>,
    pub bootloader: PathBuf,
    pub partition_table: PathBuf,
}

impl FlashFiles {
    pub fn new(
        firmware: Option<PathBuf>,
        bootloader: impl Into<PathBuf>,
        partition_table: impl Into<PathBuf>,
    ) -> Self {
        Self {
            firmware,
            bootloader: bootloader.into(),
            partition_table: partition_table.into(),
        }
    }

    /// Use the bootloader and partition table shipped next to the executable.
    pub fn bundled(firmware: Option<PathBuf>) -> Self {
        Self::new(
            firmware,
            resource_path(BOOTLOADER_FILE),
            resource_path(PARTITION_TABLE_FILE),
        )
    }

    /// Check that every file exists, listing all of the missing ones.
    pub fn resolve(&self) -> Result<FlashImages, Error> {
        let mut missing = Vec::new();

        match &self.firmware {
            Some(path) if path.is_file() => {}
            Some(path) => missing.push(path.display().to_string()),
            None => missing.push("firmware".to_owned()),
        }
        for path in [&self.bootloader, &self.partition_table] {
            if !path.is_file() {
                missing.push(path.display().to_string());
            }
        }

        match (&self.firmware, missing.is_empty()) {
            (Some(firmware), true) => Ok(FlashImages {
                bootloader: self.bootloader.clone(),
                partition_table: self.partition_table.clone(),
                firmware: firmware.clone(),
            }),
            _ => Err(Error::MissingFile(MissingFiles(missing))),
        }
    }
}

/// Locate a file bundled with the application: next to the executable if it
/// is there, otherwise in the working directory.
pub fn resource_path(name: &str) -> PathBuf {
    let beside_exe = env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)));

    match beside_exe {
        Some(path) if path.exists() => path,
        _ => PathBuf::from(name),
    }
}

/// What the user asked to be done
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    Flash(FlashFiles),
    Erase,
}

impl OperationRequest {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationRequest::Flash(_) => OperationKind::Flash,
            OperationRequest::Erase => OperationKind::Erase,
        }
    }
}

/// Terminal notification of a finished operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub kind: OperationKind,
    pub status: OperationStatus,
}

struct Progress {
    status: OperationStatus,
    cancel: CancelState,
}

struct OperationState {
    progress: Mutex<Progress>,
    done: Condvar,
    observed: AtomicBool,
}

impl OperationState {
    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to a submitted operation
#[derive(Clone)]
pub struct Operation {
    kind: OperationKind,
    state: Arc<OperationState>,
    token: CancelToken,
}

impl Operation {
    fn new(kind: OperationKind) -> Self {
        Self {
            kind,
            state: Arc::new(OperationState {
                progress: Mutex::new(Progress {
                    status: OperationStatus::Pending,
                    cancel: CancelState::NotRequested,
                }),
                done: Condvar::new(),
                observed: AtomicBool::new(true),
            }),
            token: CancelToken::new(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn status(&self) -> OperationStatus {
        self.state.lock().status.clone()
    }

    pub fn cancel_state(&self) -> CancelState {
        self.state.lock().cancel
    }

    pub fn is_finished(&self) -> bool {
        self.state.lock().status.is_finished()
    }

    /// Whether a terminal notification will still be published. Cleared when a
    /// cancellation could not be honoured.
    pub fn is_observed(&self) -> bool {
        self.state.observed.load(Ordering::SeqCst)
    }

    /// Block until the operation has finished.
    pub fn wait(&self) -> OperationStatus {
        let mut progress = self.state.lock();
        while !progress.status.is_finished() {
            progress = self
                .state
                .done
                .wait(progress)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }

        progress.status.clone()
    }

    fn set_status(&self, status: OperationStatus) {
        let mut progress = self.state.lock();
        if status == OperationStatus::Cancelled {
            progress.cancel = CancelState::Confirmed;
        }
        progress.status = status;
        self.state.done.notify_all();
    }

    fn request_cancel(&self) {
        let mut progress = self.state.lock();
        if progress.cancel == CancelState::NotRequested {
            progress.cancel = CancelState::Requested;
        }
    }
}

/// Streams progress into the log, remembering the last line seen
struct LogProgress {
    log: LogSink,
    last_line: Option<String>,
}

impl ProgressCallbacks for LogProgress {
    fn init(&mut self, addr: u32, total: usize) {
        self.log
            .system(format!("Writing {total} bytes at {addr:#x}…"));
    }

    fn line(&mut self, text: &str) {
        let text = text.trim_end();
        if text.is_empty() {
            return;
        }
        self.log.system(text);
        self.last_line = Some(text.to_owned());
    }

    fn finish(&mut self) {
        debug!("Segment finished");
    }
}

type Subscribers = Arc<Mutex<Vec<Sender<OperationReport>>>>;

/// Runs flash and erase operations against the session's port
pub struct Orchestrator {
    session: SessionManager,
    capability: Arc<dyn FlashCapability>,
    log: LogSink,
    password: String,
    current: Mutex<Option<Operation>>,
    subscribers: Subscribers,
}

impl Orchestrator {
    pub fn new(
        session: SessionManager,
        capability: Arc<dyn FlashCapability>,
        log: LogSink,
    ) -> Self {
        Self {
            session,
            capability,
            log,
            password: FLASH_PASSWORD.to_owned(),
            current: Mutex::new(None),
            subscribers: Arc::default(),
        }
    }

    /// Replace the password operations are checked against.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    /// Receive a report for every operation that finishes from now on.
    pub fn subscribe(&self) -> Receiver<OperationReport> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// The operation still running, if any
    pub fn current(&self) -> Option<Operation> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .filter(|op| !op.is_finished())
    }

    /// Validate `request` and start it in the background.
    pub fn submit(&self, request: OperationRequest, password: &str) -> Result<Operation, Error> {
        let kind = request.kind();

        if password != self.password {
            self.log
                .system(format!("❌ {} cancelled: Incorrect password.", title(kind)));
            return Err(Error::InvalidPassword);
        }

        let images = match &request {
            OperationRequest::Flash(files) => Some(files.resolve().inspect_err(|e| {
                self.log.system(format!("❌ {e}"));
            })?),
            OperationRequest::Erase => None,
        };

        let lease = self.session.begin_exclusive_operation(kind)?;
        let operation = Operation::new(kind);

        self.log.system(match kind {
            OperationKind::Flash => "Starting flash…",
            OperationKind::Erase => "Starting flash erase…",
        });

        let worker = Worker {
            operation: operation.clone(),
            session: self.session.clone(),
            capability: self.capability.clone(),
            log: self.log.clone(),
            subscribers: self.subscribers.clone(),
        };

        // If spawning fails the closure, and the lease inside it, is dropped,
        // which hands the port back to the session.
        thread::Builder::new()
            .name(format!("hexflash-{kind}"))
            .spawn(move || worker.run(lease, images))?;

        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(operation.clone());

        Ok(operation)
    }

    /// Ask the running operation to stop.
    ///
    /// When the flashing capability cannot be interrupted the operation keeps
    /// running to completion in the background; it is only no longer observed,
    /// and [Error::Unsupported] is returned.
    pub fn cancel(&self) -> Result<CancelState, Error> {
        let operation = self.current().ok_or(Error::NoOperation)?;
        operation.request_cancel();

        if self.capability.supports_cancel() {
            info!("Cancelling {}", operation.kind);
            self.log
                .system(format!("Cancelling {}…", operation.kind));
            operation.token.cancel();

            Ok(operation.cancel_state())
        } else {
            warn!("{} cannot be interrupted", operation.kind);
            operation.state.observed.store(false, Ordering::SeqCst);
            self.log.system(format!(
                "⚠️ {} could not be interrupted, it keeps running in the background until it finishes",
                title(operation.kind)
            ));

            Err(Error::Unsupported(operation.kind))
        }
    }
}

struct Worker {
    operation: Operation,
    session: SessionManager,
    capability: Arc<dyn FlashCapability>,
    log: LogSink,
    subscribers: Subscribers,
}

impl Worker {
    fn run(self, mut lease: PortLease, images: Option<FlashImages>) {
        let kind = self.operation.kind;
        self.operation.set_status(OperationStatus::Running);

        let mut progress = LogProgress {
            log: self.log.clone(),
            last_line: None,
        };
        let token = &self.operation.token;

        let result = match &images {
            Some(images) => self
                .capability
                .flash(&mut lease, images, &mut progress, token),
            None => self.capability.erase(&mut lease, &mut progress, token),
        };

        // A lost port fails the operation even if the tool claims otherwise.
        let result = match result {
            Ok(()) | Err(Error::Cancelled) if lease.port_lost() => Err(Error::Io(io::Error::new(
                ErrorKind::BrokenPipe,
                "serial port lost",
            ))),
            result => result,
        };

        let (status, summary) = match result {
            Ok(()) => (
                OperationStatus::Succeeded,
                format!("✅ {} complete.", title(kind)),
            ),
            Err(Error::Cancelled) => (
                OperationStatus::Cancelled,
                format!("{} cancelled.", title(kind)),
            ),
            Err(e) => {
                let reason = e.to_string();
                let summary = format!("❌ {} failed: {reason}", title(kind));
                let status = OperationStatus::Failed {
                    reason,
                    last_line: progress.last_line.take(),
                };
                (status, summary)
            }
        };

        let port_lost = lease.port_lost();
        self.session.end_exclusive_operation(lease, &status);

        self.log.system(summary);
        if port_lost {
            self.log.system("Serial port lost, disconnected.");
        }

        self.operation.set_status(status.clone());
        self.notify(OperationReport { kind, status });
    }

    fn notify(&self, report: OperationReport) {
        if !self.operation.is_observed() {
            debug!("{} finished unobserved: {}", report.kind, report.status);
            return;
        }

        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|tx| tx.send(report.clone()).is_ok());
    }
}

fn title(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Flash => "Flash",
        OperationKind::Erase => "Flash erase",
    }
}
