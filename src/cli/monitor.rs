use std::{
    io::{stdin, BufRead},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
    },
    thread,
    time::Duration,
};

use log::debug;
use miette::Result;

use super::print_since;
use crate::{
    log_sink::LogSink,
    monitor::{send_line, MonitorPump},
    session::{SessionManager, SessionState},
};

const REFRESH: Duration = Duration::from_millis(50);

/// Lines typed on stdin. The reader thread stays blocked on stdin until the
/// process exits, so it is never joined.
fn stdin_lines() -> Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    rx
}

/// Show device output and forward typed lines to the device until Ctrl-C,
/// end of input, or loss of the port.
pub fn monitor(
    session: &SessionManager,
    log: &LogSink,
    interrupted: &AtomicBool,
    mut seq: u64,
) -> Result<u64> {
    println!("Commands:");
    println!("    <line>    Send line to device");
    println!("    CTRL+C    Exit");
    println!();

    session.begin_monitor()?;
    let pump = MonitorPump::spawn(session.clone(), log.clone())?;
    let input = stdin_lines();
    let mut input_open = true;

    while !interrupted.swap(false, Ordering::SeqCst) {
        seq = print_since(log, seq, None);

        if session.state() == SessionState::Disconnected {
            println!("Serial port lost, disconnected.");
            break;
        }

        if !input_open {
            thread::sleep(REFRESH);
            continue;
        }

        match input.recv_timeout(REFRESH) {
            Ok(line) => {
                if let Err(e) = send_line(session, log, &line) {
                    log.system(format!("[serial] Write error: {e}"));
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("End of input, monitoring only");
                input_open = false;
            }
        }
    }

    pump.stop();
    if session.state() == SessionState::ConnectedMonitoring {
        session.end_monitor()?;
    }

    Ok(print_since(log, seq, None))
}
