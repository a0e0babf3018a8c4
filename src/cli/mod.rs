//! Terminal front-end shared by the `hexflash` binary
//!
//! No stability guaranties apply

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::RecvTimeoutError,
        Arc,
    },
    time::Duration,
};

use clap::Args;
use crossterm::style::Stylize;
use dialoguer::{theme::ColorfulTheme, Confirm, Password};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, warn, LevelFilter};
use miette::{IntoDiagnostic, Result};

use crate::{
    connection::{SystemPorts, BAUD_RATES, DEFAULT_BAUD},
    error::Error,
    log_sink::{default_export_name, LogEntry, LogSink, LogSource},
    operation::{OperationRequest, OperationStatus, Orchestrator},
    session::{OperationKind, SessionManager},
};

pub mod monitor;
pub mod serial;

const SPINNER_TICK: Duration = Duration::from_millis(100);

/// Initialize the logger with the given [LevelFilter]
pub fn initialize_logger(filter: LevelFilter) {
    env_logger::Builder::new()
        .filter_module("hexflash", filter)
        .format_target(false)
        .init();
}

/// Serial connection parameters
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port connected to the target device
    #[arg(short, long, env = "HEXFLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate of the serial monitor
    #[arg(short, long, default_value_t = DEFAULT_BAUD, value_parser = parse_baud)]
    pub baud: u32,
}

fn parse_baud(input: &str) -> Result<u32, String> {
    let baud = input
        .parse::<u32>()
        .map_err(|e| format!("invalid baud rate: {e}"))?;

    if BAUD_RATES.contains(&baud) {
        Ok(baud)
    } else {
        Err(format!("unsupported baud rate, expected one of {BAUD_RATES:?}"))
    }
}

/// Route Ctrl-C into a flag instead of terminating the process.
pub fn interrupt_flag() -> Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let flag = flag.clone();
        move || flag.store(true, Ordering::SeqCst)
    })
    .into_diagnostic()?;

    Ok(flag)
}

/// Select a port and open a session on it.
pub fn connect(args: &ConnectArgs, log: &LogSink) -> Result<SessionManager> {
    let port = serial::select_port(args)?;

    println!("Serial port: {port}");
    println!("Connecting...\n");

    let session = SessionManager::new(Arc::new(SystemPorts::default()));
    session.connect(&port, args.baud)?;
    log.system(format!("Connected to {port} @ {}", args.baud));

    Ok(session)
}

/// Disconnect, logging the outcome.
pub fn disconnect(session: &SessionManager, log: &LogSink) {
    match session.disconnect() {
        Ok(()) => {
            log.system("Disconnected");
        }
        Err(e) => warn!("Failed to disconnect: {e}"),
    }
}

fn styled(entry: &LogEntry) -> String {
    let text = entry.render();
    match entry.source {
        LogSource::Device => text,
        LogSource::System => text.cyan().to_string(),
        LogSource::User => format!("> {text}").green().to_string(),
    }
}

/// Print every entry appended since `seq`, returning the sequence number to
/// continue from.
pub fn print_since(log: &LogSink, seq: u64, bar: Option<&ProgressBar>) -> u64 {
    let entries = log.since(seq);
    for entry in &entries {
        match bar {
            Some(bar) => bar.println(styled(entry)),
            None => println!("{}", styled(entry)),
        }
    }

    entries.last().map_or(seq, |entry| entry.seq + 1)
}

/// Password from the command line, or asked for interactively.
pub fn password(given: Option<String>, kind: OperationKind) -> Result<String> {
    if let Some(password) = given {
        return Ok(password);
    }

    let action = match kind {
        OperationKind::Flash => "flash firmware",
        OperationKind::Erase => "erase flash",
    };

    let password = Password::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Enter password to {action}"))
        .allow_empty_password(true)
        .interact()
        .map_err(Error::from)?;

    Ok(password)
}

/// Ask before wiping the whole flash. `assume_yes` skips the prompt.
pub fn confirm_erase(assume_yes: bool) -> Result<bool> {
    if assume_yes {
        return Ok(true);
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(
            "⚠️ WARNING: This will erase ALL data from the flash memory!\n\
             Are you sure you want to continue?",
        )
        .default(false)
        .interact_opt()
        .map_err(Error::from)?
        .unwrap_or_default();

    Ok(confirmed)
}

/// Submit `request` and stream the log until it finishes. Ctrl-C asks the
/// operation to stop.
pub fn run_operation(
    orchestrator: &Orchestrator,
    log: &LogSink,
    request: OperationRequest,
    password: &str,
    interrupted: &AtomicBool,
) -> Result<OperationStatus> {
    let mut seq = log.next_seq();
    let reports = orchestrator.subscribe();
    let kind = request.kind();

    let operation = match orchestrator.submit(request, password) {
        Ok(operation) => operation,
        Err(e) => {
            print_since(log, seq, None);
            return Err(e.into());
        }
    };

    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} [{elapsed_precise}] {msg}")
            .into_diagnostic()?,
    );
    bar.set_message(format!("{kind} in progress, Ctrl-C to cancel"));
    bar.enable_steady_tick(SPINNER_TICK);

    let mut cancel_sent = false;
    let status = loop {
        seq = print_since(log, seq, Some(&bar));

        if interrupted.swap(false, Ordering::SeqCst) && !cancel_sent {
            cancel_sent = true;
            match orchestrator.cancel() {
                Ok(state) => debug!("Cancellation {state:?}"),
                Err(e) => bar.println(format!("{e}")),
            }
        }

        match reports.recv_timeout(SPINNER_TICK) {
            Ok(report) if report.kind == kind => break report.status,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) if operation.is_finished() => break operation.status(),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break operation.wait(),
        }
    };

    bar.finish_and_clear();
    print_since(log, seq, None);

    Ok(status)
}

/// Turn a finished operation into the process result.
pub fn check_status(status: OperationStatus) -> Result<()> {
    match status {
        OperationStatus::Succeeded => Ok(()),
        OperationStatus::Cancelled => Err(Error::Cancelled.into()),
        status => Err(miette::miette!("Operation {status}")),
    }
}

/// Export the log to `target`. A directory gets a timestamped file name.
pub fn export_log(log: &LogSink, target: &Path) -> Result<PathBuf> {
    let path = if target.is_dir() {
        target.join(default_export_name())
    } else {
        target.to_path_buf()
    };

    match log.export(&path) {
        Ok(count) => {
            debug!("Exported {count} log entries");
            println!("✅ Log exported to: {}", path.display());
            Ok(path)
        }
        Err(e) => {
            eprintln!("❌ Failed to export log: {e}");
            Err(e.into())
        }
    }
}
