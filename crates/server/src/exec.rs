//! External command execution
//!
//! Every process the server starts goes through [`CommandExecutor`]. The
//! production implementation checks the program against a fixed allow-list,
//! spawns it as an argument vector (no shell is ever involved), merges
//! stdout and stderr into one bounded capture, and kills it if it overruns
//! its timeout.
//!
//! A non-zero exit status is not an error at this layer. It is returned in
//! [`CommandOutput`] for the caller to interpret.

use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Inventory, bind and unbind tool
pub const USBIP: &str = "usbip";

/// Auxiliary descriptive-lookup tool
pub const LSUSB: &str = "lsusb";

/// Programs the server may run
pub const ALLOWED_PROGRAMS: &[&str] = &[USBIP, LSUSB];

/// Merged stdout/stderr capture budget (8 KiB)
pub const OUTPUT_BUDGET: usize = 8 * 1024;

/// Default per-command timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// How often a running child is polled for exit
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Shortest wait for the capture to finish once the child is gone
const CAPTURE_GRACE: Duration = Duration::from_millis(100);

/// Result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the child was terminated by a signal
    pub exit_code: Option<i32>,
    /// Merged stdout and stderr, at most [`OUTPUT_BUDGET`] bytes
    pub output: String,
    /// Whether output past the budget was discarded
    pub truncated: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Command execution errors
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Program not allowed: {0}")]
    NotAllowed(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut {
        program: &'static str,
        timeout: Duration,
    },

    #[error("I/O error while running {program}: {source}")]
    Io {
        program: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Runs allow-listed external programs
///
/// Implementations block the calling thread until the child exits. Call
/// them from `tokio::task::spawn_blocking` inside async code.
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError>;
}

/// Look `program` up in `allowed`, returning the static name on a hit
///
/// Matching is exact: paths, suffixes and whitespace are all rejected.
pub fn check_allowed(program: &str, allowed: &[&'static str]) -> Result<&'static str, ExecError> {
    allowed
        .iter()
        .copied()
        .find(|name| *name == program)
        .ok_or_else(|| ExecError::NotAllowed(program.to_string()))
}

/// Executor backed by `std::process::Command`
#[derive(Debug, Clone)]
pub struct SystemExecutor {
    allowed: &'static [&'static str],
    timeout: Duration,
}

impl Default for SystemExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_COMMAND_TIMEOUT)
    }
}

impl SystemExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            allowed: ALLOWED_PROGRAMS,
            timeout,
        }
    }

    #[cfg(test)]
    fn with_allow_list(allowed: &'static [&'static str], timeout: Duration) -> Self {
        Self { allowed, timeout }
    }
}

impl CommandExecutor for SystemExecutor {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ExecError> {
        let program = check_allowed(program, self.allowed)?;
        let io_err = |source| ExecError::Io { program, source };

        // One pipe shared by stdout and stderr gives a single ordered capture
        let (mut reader, writer) = io::pipe().map_err(io_err)?;
        let writer_err = writer.try_clone().map_err(io_err)?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(writer)
            .stderr(writer_err)
            .env("LC_ALL", "C");

        let mut child = command
            .spawn()
            .map_err(|source| ExecError::Spawn { program, source })?;
        // Drop our copies of the write end so the reader sees EOF when the child exits
        drop(command);

        // Detached: a grandchild holding the pipe open must not hold us past the deadline
        let (capture_tx, capture_rx) = mpsc::channel();
        thread::spawn(move || {
            let _ = capture_tx.send(read_bounded(&mut reader, OUTPUT_BUDGET));
        });

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait().map_err(io_err)? {
                Some(status) => break Some(status),
                None if Instant::now() >= deadline => {
                    warn!("{} exceeded {:?}, killing it", program, self.timeout);
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                None => thread::sleep(WAIT_POLL_INTERVAL),
            }
        };

        let grace = match status {
            Some(_) => deadline.saturating_duration_since(Instant::now()).max(CAPTURE_GRACE),
            None => CAPTURE_GRACE,
        };
        let (bytes, truncated) = match capture_rx.recv_timeout(grace) {
            Ok(capture) => capture,
            Err(_) => {
                warn!("{} left its output pipe open, discarding output", program);
                (Vec::new(), false)
            }
        };

        let Some(status) = status else {
            return Err(ExecError::TimedOut {
                program,
                timeout: self.timeout,
            });
        };

        let output = CommandOutput {
            exit_code: status.code(),
            output: String::from_utf8_lossy(&bytes).into_owned(),
            truncated,
        };

        debug!(
            "{} {} exited with {:?} ({} bytes{})",
            program,
            args.first().copied().unwrap_or_default(),
            output.exit_code,
            output.output.len(),
            if truncated { ", truncated" } else { "" }
        );

        Ok(output)
    }
}

/// Read up to `budget` bytes, then drain and discard the rest
///
/// Draining keeps the child from blocking on a full pipe.
fn read_bounded(reader: &mut impl Read, budget: usize) -> (Vec<u8>, bool) {
    let mut kept = Vec::with_capacity(budget.min(4096));
    let mut chunk = [0u8; 4096];
    let mut truncated = false;

    loop {
        match reader.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let room = budget - kept.len();
                if n > room {
                    truncated = true;
                }
                kept.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }

    (kept, truncated)
}
