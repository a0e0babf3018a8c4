#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use hexflash::{
    capability::{CancelToken, FlashCapability, FlashImages},
    connection::{PortOpener, Transport},
    progress::ProgressCallbacks,
    session::PortLease,
    Error, SessionManager,
};

/// State shared by every transport opened on the fake device
#[derive(Default)]
pub struct Device {
    /// Bytes the device will send
    pub incoming: Mutex<VecDeque<u8>>,
    /// Bytes the host wrote
    pub written: Mutex<Vec<u8>>,
    pub reads: AtomicUsize,
    pub opens: AtomicUsize,
    /// Fail every read and write from now on
    pub unplugged: AtomicBool,
    /// Time out every write without losing the device
    pub stalled_writes: AtomicBool,
    /// Transports currently inside a read or write
    busy: AtomicUsize,
    /// Highest value `busy` ever reached
    pub max_busy: AtomicUsize,
}

impl Device {
    pub fn emit(&self, data: &[u8]) {
        self.incoming.lock().unwrap().extend(data);
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    fn enter(&self) -> io::Result<()> {
        let busy = self.busy.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_busy.fetch_max(busy, Ordering::SeqCst);

        if self.unplugged.load(Ordering::SeqCst) {
            self.busy.fetch_sub(1, Ordering::SeqCst);
            return Err(ErrorKind::BrokenPipe.into());
        }

        // Widen the window in which a second accessor would be caught.
        thread::sleep(Duration::from_micros(200));
        Ok(())
    }

    fn leave(&self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeTransport(Arc<Device>);

impl Transport for FakeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.enter()?;
        self.0.reads.fetch_add(1, Ordering::SeqCst);

        let mut incoming = self.0.incoming.lock().unwrap();
        let count = buf.len().min(incoming.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.drain(..count)) {
            *slot = byte;
        }
        drop(incoming);

        self.0.leave();
        if count == 0 {
            Err(ErrorKind::TimedOut.into())
        } else {
            Ok(count)
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.enter()?;
        if self.0.stalled_writes.load(Ordering::SeqCst) {
            self.0.leave();
            return Err(ErrorKind::TimedOut.into());
        }
        self.0.written.lock().unwrap().extend_from_slice(data);
        self.0.leave();
        Ok(())
    }

    fn set_baud_rate(&mut self, _baud: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Opens [FakeTransport]s on a single shared [Device]
#[derive(Default)]
pub struct FakePorts {
    pub device: Arc<Device>,
}

impl PortOpener for FakePorts {
    fn open(&self, _device: &str, _baud: u32) -> Result<Box<dyn Transport>, Error> {
        self.device.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport(self.device.clone())))
    }
}

/// A connected session on a fresh fake device
pub fn connected_session() -> (SessionManager, Arc<Device>) {
    let ports = FakePorts::default();
    let device = ports.device.clone();
    let session = SessionManager::new(Arc::new(ports));
    session.connect("COM3", 115_200).unwrap();

    (session, device)
}

/// What a [FakeCapability] run ends with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    ExitCode(i32),
    /// Write to the port after the device was unplugged
    LosePort,
    /// Like [Outcome::LosePort], but report success anyway
    IgnoreLostPort,
}

/// Stand-in flashing tool which holds the port until released
pub struct FakeCapability {
    pub lines: Vec<String>,
    pub outcome: Outcome,
    pub cancellable: bool,
    /// Leave the port alone while waiting to be released
    pub quiet: bool,
    pub released: AtomicBool,
    pub started: AtomicBool,
    pub runs: AtomicUsize,
    /// Set once the run has returned
    pub finished: AtomicBool,
}

impl FakeCapability {
    pub fn new(outcome: Outcome) -> Self {
        Self {
            lines: Vec::new(),
            outcome,
            cancellable: true,
            quiet: false,
            released: AtomicBool::new(true),
            started: AtomicBool::new(false),
            runs: AtomicUsize::new(0),
            finished: AtomicBool::new(false),
        }
    }

    /// Block every run until [FakeCapability::release] is called.
    pub fn gated(mut self) -> Self {
        self.released = AtomicBool::new(false);
        self
    }

    pub fn uncancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn with_lines(mut self, lines: &[&str]) -> Self {
        self.lines = lines.iter().map(|line| line.to_string()).collect();
        self
    }

    pub fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    pub fn wait_started(&self) {
        wait_for(|| self.started.load(Ordering::SeqCst));
    }

    fn run(
        &self,
        port: &mut PortLease,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        progress.init(0x10000, 1024);
        port.write(b"\xc0sync\xc0")?;
        for line in &self.lines {
            progress.line(line);
        }
        self.started.store(true, Ordering::SeqCst);

        while !self.released.load(Ordering::SeqCst) {
            if self.cancellable && cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            // Keep talking to the port while waiting, like a real flasher.
            if !self.quiet {
                port.read(&mut [0; 16])?;
            }
            thread::sleep(Duration::from_millis(2));
        }
        progress.finish();

        match self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::ExitCode(code) => Err(Error::ToolFailed { code }),
            Outcome::LosePort => port.write(b"after unplug"),
            Outcome::IgnoreLostPort => {
                port.write(b"after unplug").ok();
                Ok(())
            }
        }
    }
}

impl FlashCapability for FakeCapability {
    fn flash(
        &self,
        port: &mut PortLease,
        images: &FlashImages,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        assert!(images.firmware.is_file());
        let result = self.run(port, progress, cancel);
        self.finished.store(true, Ordering::SeqCst);
        result
    }

    fn erase(
        &self,
        port: &mut PortLease,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let result = self.run(port, progress, cancel);
        self.finished.store(true, Ordering::SeqCst);
        result
    }

    fn supports_cancel(&self) -> bool {
        self.cancellable
    }
}

/// Poll `condition` until it holds, panicking after a few seconds.
pub fn wait_for(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for condition");
        thread::sleep(Duration::from_millis(2));
    }
}
