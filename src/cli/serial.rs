use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::debug;

use super::ConnectArgs;
use crate::{
    connection::{list_ports, PortDescriptor},
    error::Error,
};

/// Product strings of USB UART bridges found on common ESP32 dev boards
const KNOWN_BRIDGES: &[&str] = &["CP210", "CH340", "CH9102", "FT232", "USB JTAG"];

/// Resolve the port to connect to, either from the command line or by asking
/// the user to pick one of the detected ports.
pub fn select_port(args: &ConnectArgs) -> Result<String, Error> {
    let ports = list_ports()?;
    debug!("Detected ports: {:?}", ports);

    if let Some(port) = &args.port {
        return Ok(find_port(&ports, port).unwrap_or_else(|| port.clone()));
    }

    match ports.as_slice() {
        [] => Err(Error::NoSerial),
        [port] => {
            if confirm_port(port)? {
                Ok(port.name.clone())
            } else {
                Err(Error::SerialNotFound(port.name.clone()))
            }
        }
        ports => {
            println!(
                "Detected {} serial ports. Ports with a known USB UART bridge are highlighted.\n",
                ports.len()
            );

            let items = ports.iter().map(describe).collect::<Vec<_>>();
            let index = Select::with_theme(&ColorfulTheme::default())
                .items(&items)
                .default(0)
                .interact_opt()?
                .ok_or(Error::Cancelled)?;

            Ok(ports[index].name.clone())
        }
    }
}

/// Port names compare case-insensitively, `com3` is the same port as `COM3`.
fn find_port(ports: &[PortDescriptor], name: &str) -> Option<String> {
    ports
        .iter()
        .find(|port| port.name.eq_ignore_ascii_case(name))
        .map(|port| port.name.clone())
}

fn is_known_bridge(port: &PortDescriptor) -> bool {
    let description = port.description.to_uppercase();
    KNOWN_BRIDGES
        .iter()
        .any(|bridge| description.contains(bridge))
}

/// `name - description`, bold for known dev board bridges
pub fn describe(port: &PortDescriptor) -> String {
    let name = if is_known_bridge(port) {
        port.name.as_str().bold()
    } else {
        port.name.as_str().reset()
    };

    format!("{name} - {}", port.description)
}

fn confirm_port(port: &PortDescriptor) -> Result<bool, Error> {
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use serial port '{}' - {}?", port.name, port.description))
        .interact_opt()?
        .ok_or(Error::Cancelled)
}
