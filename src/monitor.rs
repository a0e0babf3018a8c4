//! Serial monitor poll loop
//!
//! The [MonitorPump] repeatedly asks the [SessionManager] for one bounded read
//! and turns the bytes into log lines. It never touches the port directly:
//! while an exclusive operation holds the port, or the monitor is switched
//! off, the session hands back nothing and the pump just idles.
//!
//! Output is not held back waiting for a newline forever. A partial line is
//! flushed once the device has been quiet for a short while, or once it grows
//! past a fixed size.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error};

use crate::{error::Error, log_sink::LogSink, session::SessionManager};

/// Pause between two polls of the session
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Partial lines are flushed after the device has been quiet this long
const IDLE_FLUSH: Duration = Duration::from_millis(100);

/// Partial lines longer than this are flushed without waiting for a newline
const FLUSH_THRESHOLD: usize = 256;

/// Splits a byte stream into lines on `\n`, `\r` or `\r\n`
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
    last_data: Option<Instant>,
    after_cr: bool,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed received bytes, returning every line completed by them.
    pub fn feed(&mut self, data: &[u8], now: Instant) -> Vec<String> {
        let mut lines = Vec::new();
        if !data.is_empty() {
            self.last_data = Some(now);
        }

        for &byte in data {
            if byte == b'\n' && self.after_cr {
                self.after_cr = false;
                continue;
            }
            self.after_cr = byte == b'\r';

            if byte == b'\n' || byte == b'\r' {
                lines.push(self.take());
            } else {
                self.buffer.push(byte);
                if self.buffer.len() > FLUSH_THRESHOLD {
                    lines.push(self.take());
                }
            }
        }

        lines
    }

    /// Flush a partial line if nothing has arrived for a while.
    pub fn flush_idle(&mut self, now: Instant) -> Option<String> {
        let quiet = self
            .last_data
            .is_some_and(|last| now.duration_since(last) > IDLE_FLUSH);

        if quiet && !self.buffer.is_empty() {
            self.last_data = Some(now);
            Some(self.take())
        } else {
            None
        }
    }

    /// Flush whatever is buffered.
    pub fn flush(&mut self) -> Option<String> {
        (!self.buffer.is_empty()).then(|| self.take())
    }

    fn take(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buffer).into_owned();
        self.buffer.clear();
        line
    }
}

/// Background thread feeding device output into the log
pub struct MonitorPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorPump {
    pub fn spawn(session: SessionManager, log: LogSink) -> Result<Self, Error> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = thread::Builder::new()
            .name("hexflash-monitor".into())
            .spawn({
                let stop = stop.clone();
                move || pump(&session, &log, &stop)
            })?;

        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Monitor thread panicked");
            }
        }
    }
}

impl Drop for MonitorPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn pump(session: &SessionManager, log: &LogSink, stop: &AtomicBool) {
    debug!("Monitor pump started");
    let mut framer = LineFramer::new();
    let mut buff = [0; 1024];

    while !stop.load(Ordering::SeqCst) {
        match session.poll_monitor(&mut buff) {
            Ok(Some(count)) if count > 0 => {
                for line in framer.feed(&buff[..count], Instant::now()) {
                    log.device(line);
                }
            }
            Ok(_) => {
                if let Some(line) = framer.flush_idle(Instant::now()) {
                    log.device(line);
                }
            }
            Err(e) => {
                log.system(format!("[serial] Read error: {e}"));
            }
        }

        thread::sleep(POLL_INTERVAL);
    }

    if let Some(line) = framer.flush() {
        log.device(line);
    }
    debug!("Monitor pump stopped");
}

/// Send a line of user input to the device, terminated with `\r\n`.
pub fn send_line(session: &SessionManager, log: &LogSink, text: &str) -> Result<(), Error> {
    if text.is_empty() {
        return Ok(());
    }

    session.send(format!("{text}\r\n").as_bytes())?;
    log.user(text);

    Ok(())
}
