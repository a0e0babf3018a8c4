//! Ownership of a single open serial connection
//!
//! A [SerialPortHandle] wraps whatever transport a [PortOpener] produced for a
//! device. The session manager is the only owner of a handle; an exclusive
//! operation gets to use it through a lease, never directly.

use std::{
    fmt,
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
    time::Duration,
};

use log::{debug, warn};
use serialport::{available_ports, FlowControl, SerialPort, SerialPortInfo, SerialPortType};

use crate::error::Error;

/// Upper bound for a single blocking read on the port
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Upper bound for writing one chunk of user input or tool traffic
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Baud rate used when none is specified
pub const DEFAULT_BAUD: u32 = 115_200;

/// Baud rates offered for the serial monitor
pub const BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115_200, 230_400, 460_800];

/// Raw byte stream to a device
pub trait Transport: Send {
    /// Read available bytes. Must return within a bounded time.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()>;
}

/// Opens transports for named devices
pub trait PortOpener: Send + Sync {
    fn open(&self, device: &str, baud: u32) -> Result<Box<dyn Transport>, Error>;
}

/// Opens real OS serial ports through `serialport`
#[derive(Debug, Clone)]
pub struct SystemPorts {
    timeout: Duration,
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self {
            timeout: READ_TIMEOUT,
        }
    }
}

impl PortOpener for SystemPorts {
    fn open(&self, device: &str, baud: u32) -> Result<Box<dyn Transport>, Error> {
        let serial = serialport::new(device, baud)
            .flow_control(FlowControl::None)
            .timeout(self.timeout)
            .open()
            .map_err(|source| Error::PortUnavailable {
                port: device.to_owned(),
                source,
            })?;

        Ok(Box::new(SystemTransport(serial)))
    }
}

struct SystemTransport(Box<dyn SerialPort>);

impl Transport for SystemTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    // serialport has one timeout for both directions, so writes get a longer
    // one for their duration.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let read_timeout = self.0.timeout();
        self.0.set_timeout(WRITE_TIMEOUT)?;

        let result = self.0.write_all(data).and_then(|()| self.0.flush());
        self.0.set_timeout(read_timeout)?;

        result
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.0.set_baud_rate(baud).map_err(io::Error::from)
    }
}

/// One open serial connection: device, baud rate and open/closed state
pub struct SerialPortHandle {
    device: String,
    baud: u32,
    opener: Arc<dyn PortOpener>,
    transport: Option<Box<dyn Transport>>,
}

impl SerialPortHandle {
    /// Open `device` at `baud`, taking the OS-level lock on it.
    pub fn open(opener: Arc<dyn PortOpener>, device: &str, baud: u32) -> Result<Self, Error> {
        debug!("Opening serial port {} at {} baud", device, baud);
        let transport = opener.open(device, baud)?;

        Ok(Self {
            device: device.to_owned(),
            baud,
            opener,
            transport: Some(transport),
        })
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Read whatever the device has sent. A read timeout is not an error and
    /// yields zero bytes.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let transport = self.transport.as_mut().ok_or_else(closed)?;

        match transport.read(buf) {
            Ok(count) => Ok(count),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        transport.write_all(data)?;

        Ok(())
    }

    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        let transport = self.transport.as_mut().ok_or_else(closed)?;
        transport.set_baud_rate(baud)?;
        self.baud = baud;

        Ok(())
    }

    /// Release the OS-level lock for the duration of `f`, then reopen the
    /// device at the same baud rate.
    ///
    /// External tools which open the device by name need this. The handle
    /// itself stays with its current owner, so nobody else can claim the
    /// device in the meantime. If the device cannot be reopened the error
    /// records how `f` finished.
    pub fn with_released<T>(
        &mut self,
        f: impl FnOnce(&str, u32) -> Result<T, Error>,
    ) -> Result<T, Error> {
        self.transport = None;
        debug!("Released {} for an external tool", self.device);

        let result = f(&self.device, self.baud);

        match self.opener.open(&self.device, self.baud) {
            Ok(transport) => self.transport = Some(transport),
            Err(source) => {
                let outcome = match &result {
                    Ok(_) => "tool succeeded".to_owned(),
                    Err(e) => e.to_string(),
                };
                warn!("Could not reopen {} after the tool ran: {outcome}", self.device);

                return Err(Error::PortNotReacquired {
                    port: self.device.clone(),
                    outcome,
                    source: Box::new(source),
                });
            }
        }
        debug!("Reacquired {}", self.device);

        result
    }

    /// Close the port. Calling this more than once is harmless.
    pub fn close(&mut self) {
        if self.transport.take().is_some() {
            debug!("Closed serial port {}", self.device);
        }
    }
}

impl Drop for SerialPortHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SerialPortHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPortHandle")
            .field("device", &self.device)
            .field("baud", &self.baud)
            .field("open", &self.is_open())
            .finish()
    }
}

fn closed() -> Error {
    Error::Io(io::Error::new(
        ErrorKind::NotConnected,
        "serial port is closed",
    ))
}

/// A serial port found on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDescriptor {
    pub name: String,
    pub description: String,
}

/// List the USB and unidentified serial ports present on the host system.
pub fn list_ports() -> Result<Vec<PortDescriptor>, Error> {
    let ports = available_ports().map_err(io::Error::from)?;

    Ok(ports.into_iter().filter_map(port_descriptor).collect())
}

/// Describe a port a device could be attached to. PCI and Bluetooth ports are
/// skipped.
fn port_descriptor(info: SerialPortInfo) -> Option<PortDescriptor> {
    let description = match &info.port_type {
        SerialPortType::UsbPort(usb) => usb
            .product
            .clone()
            .unwrap_or_else(|| format!("USB {:04x}:{:04x}", usb.vid, usb.pid)),
        SerialPortType::Unknown => "n/a".to_owned(),
        SerialPortType::PciPort | SerialPortType::BluetoothPort => {
            debug!("Skipping non-USB serial port {}", info.port_name);
            return None;
        }
    };

    Some(PortDescriptor {
        name: info.port_name,
        description,
    })
}
