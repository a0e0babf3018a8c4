//! The flashing capability
//!
//! Chip detection, stub loading and the serial framing used to talk to the
//! ROM loader all live in an external flashing tool. This module only states
//! what the rest of the crate needs from it ([FlashCapability]) and provides
//! [ExternalTool], which drives an installed `espflash` or `esptool.py`.

use std::{
    ffi::OsString,
    fs,
    io::{ErrorKind, Read},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError, Sender},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use log::{debug, warn};
use strum::{Display, EnumString, VariantNames};

use crate::{error::Error, monitor::LineFramer, progress::ProgressCallbacks, session::PortLease};

/// Flash offset of the second stage bootloader on the ESP32
pub const BOOTLOADER_ADDR: u32 = 0x1000;
/// Flash offset of the partition table
pub const PARTITION_TABLE_ADDR: u32 = 0x8000;
/// Flash offset of the application image
pub const APP_ADDR: u32 = 0x10000;

/// How often a running tool is checked for cancellation
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Files written by a flash operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImages {
    pub bootloader: PathBuf,
    pub partition_table: PathBuf,
    pub firmware: PathBuf,
}

impl FlashImages {
    /// Every image paired with the flash offset it is written to
    pub fn segments(&self) -> [(u32, &Path); 3] {
        [
            (BOOTLOADER_ADDR, self.bootloader.as_path()),
            (PARTITION_TABLE_ADDR, self.partition_table.as_path()),
            (APP_ADDR, self.firmware.as_path()),
        ]
    }
}

/// Cooperative cancellation flag shared with a running operation
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Whatever is able to write images to, or erase, the device behind a port
pub trait FlashCapability: Send + Sync {
    fn flash(
        &self,
        port: &mut PortLease,
        images: &FlashImages,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error>;

    fn erase(
        &self,
        port: &mut PortLease,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error>;

    /// Whether a running operation stops when its [CancelToken] is tripped.
    /// Implementations which cannot be interrupted keep running to completion.
    fn supports_cancel(&self) -> bool {
        false
    }
}

/// Command-line flashing tools [ExternalTool] knows how to drive
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, VariantNames)]
#[strum(serialize_all = "lowercase")]
pub enum ToolFlavor {
    /// espflash, one `write-bin` per image
    Espflash,
    /// esptool.py, all images in a single `write_flash`
    Esptool,
}

impl ToolFlavor {
    fn default_program(self) -> &'static str {
        match self {
            ToolFlavor::Espflash => "espflash",
            ToolFlavor::Esptool => "esptool.py",
        }
    }
}

/// Target and flash parameters handed to the tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashSettings {
    pub chip: String,
    pub baud: u32,
    pub mode: String,
    pub frequency: String,
    pub size: String,
}

impl Default for FlashSettings {
    fn default() -> Self {
        Self {
            chip: "esp32".into(),
            baud: 460_800,
            mode: "dio".into(),
            frequency: "40m".into(),
            size: "4MB".into(),
        }
    }
}

/// Runs an installed flashing tool against the leased port
///
/// The tool opens the device by name, so the port is released for the
/// duration of each invocation and reacquired afterwards. Output is streamed
/// line by line, and a cancelled run is stopped by killing the tool.
#[derive(Debug, Clone)]
pub struct ExternalTool {
    program: OsString,
    flavor: ToolFlavor,
    settings: FlashSettings,
}

impl ExternalTool {
    pub fn new(flavor: ToolFlavor) -> Self {
        Self {
            program: flavor.default_program().into(),
            flavor,
            settings: FlashSettings::default(),
        }
    }

    /// Use the executable at `program` instead of looking the tool up on `PATH`
    pub fn with_program(mut self, program: impl Into<OsString>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_settings(mut self, settings: FlashSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn flavor(&self) -> ToolFlavor {
        self.flavor
    }

    /// Argument lists of the invocations which flash `images`, in order.
    /// Each entry is paired with the first segment it writes.
    pub fn flash_invocations(
        &self,
        device: &str,
        images: &FlashImages,
    ) -> Vec<(u32, Vec<OsString>)> {
        let s = &self.settings;

        match self.flavor {
            ToolFlavor::Espflash => images
                .segments()
                .into_iter()
                .map(|(addr, path)| {
                    let mut args = os_args(&["write-bin", "--port", device]);
                    args.extend(os_args_owned([
                        "--baud".into(),
                        s.baud.to_string(),
                        "--chip".into(),
                        s.chip.clone(),
                        format!("{addr:#x}"),
                    ]));
                    args.push(path.into());
                    (addr, args)
                })
                .collect(),
            ToolFlavor::Esptool => {
                let mut args = os_args_owned([
                    "--chip".into(),
                    s.chip.clone(),
                    "--port".into(),
                    device.into(),
                    "--baud".into(),
                    s.baud.to_string(),
                    "write_flash".into(),
                    "-z".into(),
                    "--flash_mode".into(),
                    s.mode.clone(),
                    "--flash_freq".into(),
                    s.frequency.clone(),
                    "--flash_size".into(),
                    s.size.clone(),
                ]);
                for (addr, path) in images.segments() {
                    args.push(format!("{addr:#x}").into());
                    args.push(path.into());
                }
                vec![(BOOTLOADER_ADDR, args)]
            }
        }
    }

    /// Argument list of the invocation which erases the whole flash
    pub fn erase_invocation(&self, device: &str) -> Vec<OsString> {
        match self.flavor {
            ToolFlavor::Espflash => {
                let mut args = os_args(&["erase-flash", "--port", device, "--chip"]);
                args.push(self.settings.chip.clone().into());
                args
            }
            ToolFlavor::Esptool => {
                let mut args = os_args(&["--chip"]);
                args.extend(os_args_owned([
                    self.settings.chip.clone(),
                    "--port".into(),
                    device.into(),
                    "erase_flash".into(),
                ]));
                args
            }
        }
    }

    fn run(
        &self,
        args: &[OsString],
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        debug!("Running {:?} {:?}", self.program, args);

        let mut child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| Error::ToolUnavailable {
                program: self.program.to_string_lossy().into_owned(),
                source,
            })?;

        let (tx, rx) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        loop {
            if cancel.is_cancelled() {
                terminate(&mut child);
                return Err(Error::Cancelled);
            }

            match rx.recv_timeout(CANCEL_POLL) {
                Ok(line) => progress.line(&line),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        for reader in readers {
            reader.join().ok();
        }

        let status = child.wait()?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let code = status.code().unwrap_or(1);
        debug!("Tool exit code: {code}");
        if status.success() {
            Ok(())
        } else {
            Err(Error::ToolFailed { code })
        }
    }
}

impl FlashCapability for ExternalTool {
    fn flash(
        &self,
        port: &mut PortLease,
        images: &FlashImages,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let invocations = self.flash_invocations(port.device(), images);
        let total: usize = images
            .segments()
            .iter()
            .map(|(_, path)| fs::metadata(path).map(|m| m.len() as usize).unwrap_or(0))
            .sum();

        port.with_released(|_, _| {
            for (addr, args) in &invocations {
                let size = match self.flavor {
                    ToolFlavor::Esptool => total,
                    ToolFlavor::Espflash => images
                        .segments()
                        .iter()
                        .find(|(a, _)| a == addr)
                        .and_then(|(_, path)| fs::metadata(path).ok())
                        .map(|m| m.len() as usize)
                        .unwrap_or(0),
                };

                progress.init(*addr, size);
                self.run(args, progress, cancel)?;
                progress.finish();
            }

            Ok(())
        })
    }

    fn erase(
        &self,
        port: &mut PortLease,
        progress: &mut dyn ProgressCallbacks,
        cancel: &CancelToken,
    ) -> Result<(), Error> {
        let args = self.erase_invocation(port.device());

        port.with_released(|_, _| self.run(&args, progress, cancel))
    }

    fn supports_cancel(&self) -> bool {
        true
    }
}

fn os_args(items: &[&str]) -> Vec<OsString> {
    items.iter().map(OsString::from).collect()
}

fn os_args_owned<const N: usize>(items: [String; N]) -> Vec<OsString> {
    items.into_iter().map(OsString::from).collect()
}

/// Read `source` until it closes, sending every completed line to `tx`.
fn forward_lines<R: Read + Send + 'static>(
    mut source: R,
    tx: Sender<String>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut framer = LineFramer::new();
        let mut buff = [0; 512];

        loop {
            let count = match source.read(&mut buff) {
                Ok(0) => break,
                Ok(count) => count,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            };

            for line in framer.feed(&buff[..count], Instant::now()) {
                if tx.send(line).is_err() {
                    return;
                }
            }
        }

        if let Some(line) = framer.flush() {
            tx.send(line).ok();
        }
    })
}

fn terminate(child: &mut Child) {
    if let Err(e) = child.kill() {
        warn!("Failed to stop flashing tool: {e}");
    }
    child.wait().ok();
}
