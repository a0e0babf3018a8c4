use std::{
    env,
    path::PathBuf,
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use hexflash::{
    capability::{ExternalTool, FlashSettings, ToolFlavor},
    cli::{
        self, check_status, confirm_erase, connect, disconnect, export_log, initialize_logger,
        monitor::monitor, print_since, run_operation, serial::describe, ConnectArgs,
    },
    config::ConfigStore,
    connection::list_ports,
    firmware::{FirmwareSource, HttpFirmwareSource},
    log_sink::LogSink,
    operation::{
        resource_path, FlashFiles, OperationRequest, OperationStatus, Orchestrator,
        BOOTLOADER_FILE, PARTITION_TABLE_FILE,
    },
    session::OperationKind,
};
use log::{debug, LevelFilter};
use miette::{miette, IntoDiagnostic, Result};

#[derive(Debug, Parser)]
#[command(about, propagate_version = true, version)]
struct Cli {
    /// Verbosity of diagnostic messages
    #[arg(long, global = true, default_value = "info")]
    log_level: LevelFilter,
    /// Prefix log lines with the time they were recorded
    #[arg(long, global = true)]
    timestamps: bool,
    /// Write the session log to this file, or into this directory, on exit
    #[arg(long, global = true, value_name = "PATH")]
    export_log: Option<PathBuf>,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List the serial ports present on this system
    Ports,
    /// Open the serial monitor without flashing
    Monitor(ConnectArgs),
    /// Flash the bootloader, partition table and application to a device
    Flash(FlashArgs),
    /// Erase the entire flash of a device
    Erase(EraseArgs),
    /// Show or change the firmware server host
    Host(HostArgs),
    /// List the firmware images offered by the firmware server
    Firmwares,
}

#[derive(Debug, Args)]
struct ToolArgs {
    /// Flashing tool to drive
    #[arg(long, value_enum, default_value_t = ToolFlavor::Espflash)]
    flavor: ToolFlavor,
    /// Path to the flashing tool, if it is not on PATH
    #[arg(long, value_name = "PROGRAM")]
    tool: Option<PathBuf>,
    /// Baud rate used while flashing
    #[arg(long)]
    flash_baud: Option<u32>,
    /// Operation password, prompted for when omitted
    #[arg(long, env = "HEXFLASH_PASSWORD", hide_env_values = true)]
    password: Option<String>,
}

impl ToolArgs {
    fn tool(&self) -> ExternalTool {
        let mut settings = FlashSettings::default();
        if let Some(baud) = self.flash_baud {
            settings.baud = baud;
        }

        let tool = ExternalTool::new(self.flavor).with_settings(settings);
        match &self.tool {
            Some(program) => tool.with_program(program.clone()),
            None => tool,
        }
    }
}

#[derive(Debug, Args)]
struct FlashArgs {
    /// Application image to write at 0x10000
    #[arg(long, conflicts_with = "remote")]
    firmware: Option<PathBuf>,
    /// Download the named image from the firmware server instead
    #[arg(long, value_name = "NAME")]
    remote: Option<String>,
    /// Second stage bootloader, defaults to the bundled bootloader.bin
    #[arg(long)]
    bootloader: Option<PathBuf>,
    /// Partition table, defaults to the bundled partitions.bin
    #[arg(long)]
    partition_table: Option<PathBuf>,
    /// Open the serial monitor after flashing
    #[arg(long)]
    monitor: bool,

    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(flatten)]
    tool_args: ToolArgs,
}

#[derive(Debug, Args)]
struct EraseArgs {
    /// Do not ask for confirmation
    #[arg(short, long)]
    yes: bool,

    #[command(flatten)]
    connect_args: ConnectArgs,
    #[command(flatten)]
    tool_args: ToolArgs,
}

#[derive(Debug, Args)]
struct HostArgs {
    /// New host, `https://` is assumed when no scheme is given
    host: Option<String>,
}

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse();
    initialize_logger(args.log_level);
    debug!("{:#?}", args);

    let log = LogSink::new();
    log.set_timestamps(args.timestamps);
    let config = ConfigStore::locate();
    debug!("Configuration file: {}", config.path().display());

    let result = match args.subcommand {
        Commands::Ports => ports(),
        Commands::Monitor(connect_args) => serial_monitor(connect_args, &log),
        Commands::Flash(flash_args) => flash(flash_args, &config, &log),
        Commands::Erase(erase_args) => erase(erase_args, &log),
        Commands::Host(host_args) => host(host_args, &config),
        Commands::Firmwares => firmwares(&config),
    };

    if let Some(target) = &args.export_log {
        export_log(&log, target)?;
    }

    result
}

fn ports() -> Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports detected");
    }
    for port in &ports {
        println!("{}", describe(port));
    }

    Ok(())
}

fn serial_monitor(args: ConnectArgs, log: &LogSink) -> Result<()> {
    let interrupted = cli::interrupt_flag()?;
    let session = connect(&args, log)?;

    let result = monitor(&session, log, &interrupted, 0);
    disconnect(&session, log);
    print_since(log, result.as_ref().copied().unwrap_or(0), None);

    result.map(drop)
}

fn flash(args: FlashArgs, config: &ConfigStore, log: &LogSink) -> Result<()> {
    let firmware = match (args.firmware, &args.remote) {
        (Some(path), _) => Some(path),
        (None, Some(name)) => Some(download_firmware(config, log, name)?),
        (None, None) => None,
    };
    let files = FlashFiles::new(
        firmware,
        args.bootloader
            .unwrap_or_else(|| resource_path(BOOTLOADER_FILE)),
        args.partition_table
            .unwrap_or_else(|| resource_path(PARTITION_TABLE_FILE)),
    );
    debug!("{files:#?}");

    let interrupted = cli::interrupt_flag()?;
    let session = connect(&args.connect_args, log)?;
    print_since(log, 0, None);

    let status = cli::password(args.tool_args.password.clone(), OperationKind::Flash).and_then(
        |password| {
            let orchestrator =
                Orchestrator::new(session.clone(), Arc::new(args.tool_args.tool()), log.clone());
            run_operation(
                &orchestrator,
                log,
                OperationRequest::Flash(files),
                &password,
                &interrupted,
            )
        },
    );

    if args.monitor && matches!(status, Ok(OperationStatus::Succeeded)) {
        if let Err(e) = monitor(&session, log, &interrupted, log.next_seq()) {
            eprintln!("{e:?}");
        }
    }

    disconnect(&session, log);
    check_status(status?)
}

fn erase(args: EraseArgs, log: &LogSink) -> Result<()> {
    if !confirm_erase(args.yes)? {
        println!("Erase aborted");
        return Ok(());
    }

    let interrupted = cli::interrupt_flag()?;
    let session = connect(&args.connect_args, log)?;
    print_since(log, 0, None);

    let status = cli::password(args.tool_args.password.clone(), OperationKind::Erase).and_then(
        |password| {
            let orchestrator =
                Orchestrator::new(session.clone(), Arc::new(args.tool_args.tool()), log.clone());
            run_operation(
                &orchestrator,
                log,
                OperationRequest::Erase,
                &password,
                &interrupted,
            )
        },
    );

    disconnect(&session, log);
    check_status(status?)
}

fn host(args: HostArgs, config: &ConfigStore) -> Result<()> {
    match args.host {
        Some(host) => match config.set_host(&host)? {
            Some(host) => println!("API Host changed to: {host}"),
            None => println!("Host unchanged: {}", config.host()),
        },
        None => {
            println!("API Host: {}", config.host());
            println!("Firmware listing: {}", config.api_url());
        }
    }

    Ok(())
}

fn firmwares(config: &ConfigStore) -> Result<()> {
    let source = HttpFirmwareSource::new(config.api_url())?;
    let firmwares = source
        .list_firmwares()
        .map_err(|e| miette!("Failed to fetch firmware list: {e}"))?;

    if firmwares.is_empty() {
        println!("No firmware available on {}", source.api_url());
    }
    for firmware in &firmwares {
        match &firmware.url {
            Some(url) => println!("{firmware}  ({url})"),
            None => println!("{firmware}  (not downloadable)"),
        }
    }

    Ok(())
}

fn download_firmware(config: &ConfigStore, log: &LogSink, name: &str) -> Result<PathBuf> {
    let source = HttpFirmwareSource::new(config.api_url())?;
    let firmwares = source.list_firmwares()?;
    let firmware = firmwares
        .iter()
        .find(|firmware| firmware.name == name || firmware.to_string() == name)
        .ok_or_else(|| miette!("No firmware named '{name}' on {}", source.api_url()))?;

    log.system(format!("Downloading firmware: {firmware}"));
    let dir = env::current_dir().into_diagnostic()?;
    let path = source.download(firmware, &dir)?;
    log.system(format!("Saved firmware to {}", path.display()));

    Ok(path)
}
