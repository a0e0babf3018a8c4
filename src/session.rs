//! Arbitration of the single serial connection
//!
//! The [SessionManager] is the only owner of the [SerialPortHandle]. It hands
//! out access to exactly one consumer at a time: either the monitor poll loop
//! (through [SessionManager::poll_monitor]) or a running flash/erase operation
//! (through a [PortLease]). Beginning an exclusive operation moves the handle
//! into the lease, so the monitor has nothing left to read from until the
//! lease is returned.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use log::{debug, info, warn};
use strum::{Display, EnumString, VariantNames};

use crate::{
    connection::{PortOpener, SerialPortHandle},
    error::Error,
    operation::OperationStatus,
};

/// Current state of the serial session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    ConnectedIdle,
    ConnectedMonitoring,
    OperationInProgress,
}

impl SessionState {
    pub fn is_connected(self) -> bool {
        self != SessionState::Disconnected
    }
}

/// Operations which need sole use of the serial line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum OperationKind {
    Flash,
    Erase,
}

struct Inner {
    state: SessionState,
    port: Option<SerialPortHandle>,
    device: Option<String>,
    active: Option<OperationKind>,
}

struct Shared {
    opener: Arc<dyn PortOpener>,
    inner: Mutex<Inner>,
    holders: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock cannot leave `Inner` half-updated,
        // every transition is a handful of plain assignments.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish(
        &self,
        mut handle: SerialPortHandle,
        port_lost: bool,
        kind: OperationKind,
        status: &OperationStatus,
    ) {
        let mut inner = self.lock();
        self.holders.fetch_sub(1, Ordering::SeqCst);
        inner.active = None;

        if port_lost {
            warn!(
                "Lost serial port {} during {kind} ({status}), disconnecting",
                handle.device()
            );
            handle.close();
            inner.port = None;
            inner.device = None;
            inner.state = SessionState::Disconnected;
        } else {
            info!("{kind} finished ({status}), {} is idle", handle.device());
            inner.port = Some(handle);
            inner.state = SessionState::ConnectedIdle;
        }
    }
}

/// Single source of truth for the [SessionState]
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(opener: Arc<dyn PortOpener>) -> Self {
        Self {
            shared: Arc::new(Shared {
                opener,
                inner: Mutex::new(Inner {
                    state: SessionState::Disconnected,
                    port: None,
                    device: None,
                    active: None,
                }),
                holders: AtomicUsize::new(0),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// Name of the connected device, if any
    pub fn device(&self) -> Option<String> {
        self.shared.lock().device.clone()
    }

    /// Kind of the exclusive operation currently holding the port
    pub fn active_operation(&self) -> Option<OperationKind> {
        self.shared.lock().active
    }

    /// Number of consumers currently holding exclusive device access: a
    /// monitor read in flight or an outstanding [PortLease]. Never above one.
    pub fn exclusive_holders(&self) -> usize {
        self.shared.holders.load(Ordering::SeqCst)
    }

    /// Open `device` and move to [SessionState::ConnectedIdle].
    pub fn connect(&self, device: &str, baud: u32) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        if inner.state != SessionState::Disconnected {
            return Err(Error::AlreadyConnected);
        }

        let handle = SerialPortHandle::open(self.shared.opener.clone(), device, baud)?;
        inner.port = Some(handle);
        inner.device = Some(device.to_owned());
        inner.state = SessionState::ConnectedIdle;
        info!("Connected to {device} at {baud} baud");

        Ok(())
    }

    /// Close the port. Refused while an exclusive operation is running.
    pub fn disconnect(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::OperationInProgress => Err(Error::OperationInProgress),
            SessionState::ConnectedIdle | SessionState::ConnectedMonitoring => {
                if let Some(mut port) = inner.port.take() {
                    port.close();
                }
                inner.device = None;
                inner.state = SessionState::Disconnected;
                info!("Disconnected");

                Ok(())
            }
        }
    }

    pub fn begin_monitor(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::OperationInProgress => Err(Error::OperationInProgress),
            SessionState::ConnectedIdle | SessionState::ConnectedMonitoring => {
                inner.state = SessionState::ConnectedMonitoring;
                debug!("Monitor enabled");
                Ok(())
            }
        }
    }

    pub fn end_monitor(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::OperationInProgress => Err(Error::OperationInProgress),
            SessionState::ConnectedIdle | SessionState::ConnectedMonitoring => {
                inner.state = SessionState::ConnectedIdle;
                debug!("Monitor disabled");
                Ok(())
            }
        }
    }

    /// Perform one bounded read for the monitor.
    ///
    /// Returns `None` without touching the device unless the session is in
    /// [SessionState::ConnectedMonitoring]. A fatal read error closes the port
    /// and moves the session to [SessionState::Disconnected].
    pub fn poll_monitor(&self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        if inner.state != SessionState::ConnectedMonitoring {
            return Ok(None);
        }
        let Some(port) = inner.port.as_mut() else {
            return Ok(None);
        };

        self.shared.holders.fetch_add(1, Ordering::SeqCst);
        let result = port.read(buf);
        self.shared.holders.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(count) => Ok(Some(count)),
            Err(e) => {
                if e.is_fatal_io() {
                    warn!("Read error on {}: {e}, disconnecting", port.device());
                    port.close();
                    inner.port = None;
                    inner.device = None;
                    inner.state = SessionState::Disconnected;
                }
                Err(e)
            }
        }
    }

    /// Forward user input to the device.
    pub fn send(&self, data: &[u8]) -> Result<(), Error> {
        let mut guard = self.shared.lock();
        let inner = &mut *guard;
        match inner.state {
            SessionState::Disconnected => return Err(Error::NotConnected),
            SessionState::OperationInProgress => return Err(Error::OperationInProgress),
            SessionState::ConnectedIdle | SessionState::ConnectedMonitoring => {}
        }
        let port = inner.port.as_mut().ok_or(Error::NotConnected)?;

        if let Err(e) = port.write(data) {
            if e.is_fatal_io() {
                warn!("Write error on {}: {e}, disconnecting", port.device());
                port.close();
                inner.port = None;
                inner.device = None;
                inner.state = SessionState::Disconnected;
            }
            return Err(e);
        }

        Ok(())
    }

    /// Change the baud rate of the connected port.
    pub fn set_baud(&self, baud: u32) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Disconnected => Err(Error::NotConnected),
            SessionState::OperationInProgress => Err(Error::OperationInProgress),
            SessionState::ConnectedIdle | SessionState::ConnectedMonitoring => {
                let port = inner.port.as_mut().ok_or(Error::NotConnected)?;
                port.set_baud(baud)?;
                debug!("Baud rate changed to {baud}");
                Ok(())
            }
        }
    }

    /// Claim sole use of the port for `kind`, suspending the monitor if it was
    /// running. The monitor is not resumed afterwards.
    pub fn begin_exclusive_operation(&self, kind: OperationKind) -> Result<PortLease, Error> {
        let mut inner = self.shared.lock();
        match inner.state {
            SessionState::Disconnected => return Err(Error::NotConnected),
            SessionState::OperationInProgress => {
                return Err(Error::AlreadyInProgress(inner.active.unwrap_or(kind)))
            }
            SessionState::ConnectedMonitoring => debug!("Suspending monitor for {kind}"),
            SessionState::ConnectedIdle => {}
        }

        let handle = inner.port.take().ok_or(Error::NotConnected)?;
        inner.state = SessionState::OperationInProgress;
        inner.active = Some(kind);
        self.shared.holders.fetch_add(1, Ordering::SeqCst);
        info!("Starting exclusive {kind} on {}", handle.device());

        Ok(PortLease {
            kind,
            handle: Some(handle),
            port_lost: false,
            shared: self.shared.clone(),
        })
    }

    /// Return the port after an exclusive operation. The session goes back to
    /// [SessionState::ConnectedIdle], or to [SessionState::Disconnected] if the
    /// operation lost the port.
    pub fn end_exclusive_operation(&self, mut lease: PortLease, status: &OperationStatus) {
        lease.release(status);
    }
}

/// Sole access to the serial port for the duration of one exclusive operation
///
/// All device I/O of a running operation goes through the lease. A lease
/// dropped without being handed back to
/// [SessionManager::end_exclusive_operation] still returns the port, recording
/// the operation as failed.
pub struct PortLease {
    kind: OperationKind,
    handle: Option<SerialPortHandle>,
    port_lost: bool,
    shared: Arc<Shared>,
}

impl PortLease {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Whether a fatal I/O error was seen on the port
    pub fn port_lost(&self) -> bool {
        self.port_lost
    }

    pub fn device(&self) -> &str {
        self.handle.as_ref().map(|h| h.device()).unwrap_or_default()
    }

    pub fn baud(&self) -> u32 {
        self.handle.as_ref().map(|h| h.baud()).unwrap_or_default()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let result = self.handle()?.read(buf);
        self.track(result)
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let result = self.handle()?.write(data);
        self.track(result)
    }

    /// See [SerialPortHandle::with_released].
    pub fn with_released<T>(
        &mut self,
        f: impl FnOnce(&str, u32) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = self.handle()?.with_released(f);
        if matches!(result, Err(Error::PortNotReacquired { .. })) {
            self.port_lost = true;
        }
        result
    }

    fn handle(&mut self) -> Result<&mut SerialPortHandle, Error> {
        self.handle.as_mut().ok_or(Error::NotConnected)
    }

    fn track<T>(&mut self, result: Result<T, Error>) -> Result<T, Error> {
        if matches!(&result, Err(e) if e.is_fatal_io()) {
            self.port_lost = true;
        }
        result
    }

    fn release(&mut self, status: &OperationStatus) {
        if let Some(handle) = self.handle.take() {
            self.shared.finish(handle, self.port_lost, self.kind, status);
        }
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("{} lease dropped without being returned", self.kind);
            self.release(&OperationStatus::Failed {
                reason: "operation aborted".into(),
                last_line: None,
            });
        }
    }
}
