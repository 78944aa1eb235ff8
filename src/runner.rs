//! Launches a child process, captures its output, and enforces a wall-clock
//! timeout — the one primitive every other subprocess-driving component
//! (the compiler driver, the executor, the coverage tracker) is built on.
//!
//! Non-zero exits are data, not errors: this module never returns `Err` for
//! a process that merely failed. A timeout is reported the same way, via a
//! distinguished exit code, so callers have one code path for both.

use std::io::Read;
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::error::Result;

/// Exit code used when a command is killed after exceeding its timeout.
/// Chosen to be distinguishable from any real exit status (which is at most
/// a byte on POSIX) without colliding with the 128+signo convention used for
/// decoded signals.
pub const TIMEOUT_EXIT_CODE: i32 = -9999;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub timed_out: bool,
    pub wall_time: Duration,
}

impl CommandOutput {
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Patterns an emulator's stderr uses to report that the guest died from a
/// signal the emulator itself caught, rather than exiting normally. Ordered
/// by how QEMU-alikes typically phrase the numeric form and the named form.
const WELL_KNOWN_SIGNALS: &[(&str, i32)] = &[
    ("Segmentation fault", 11),
    ("Aborted", 6),
    ("Illegal instruction", 4),
    ("Bus error", 7),
    ("Floating point exception", 8),
];

/// Run `binary argv[..]` to completion or until `timeout` elapses.
///
/// The command is spawned directly (no shell), with stdin closed so a
/// hanging read can never be the reason for a timeout. If the process is
/// still alive when the timeout fires, it's killed (its whole process group,
/// so children it spawned don't leak) and `timed_out` is set with
/// [`TIMEOUT_EXIT_CODE`] as the exit code.
pub fn run(binary: &Path, argv: &[String], timeout: Duration) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut child = Command::new(binary)
        .args(argv)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let poll_interval = Duration::from_millis(20);
    let timed_out = loop {
        match child.try_wait()? {
            Some(_status) => break false,
            None => {
                if start.elapsed() >= timeout {
                    let _ = nix::sys::signal::kill(
                        Pid::from_raw(child.id() as i32),
                        Signal::SIGKILL,
                    );
                    let _ = child.wait();
                    break true;
                }
                std::thread::sleep(poll_interval);
            }
        }
    };

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr);
    }

    let exit_code = if timed_out {
        TIMEOUT_EXIT_CODE
    } else {
        match child.wait()? {
            status => exit_status_to_code(&status),
        }
    };

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
        wall_time: start.elapsed(),
    })
}

fn exit_status_to_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    if let Some(code) = status.code() {
        code
    } else if let Some(signo) = status.signal() {
        128 + signo
    } else {
        -1
    }
}

/// Convert an emulator's reported signal into a canonical `128 + signo` exit
/// code, per the patterns `qemu`-alikes print to stderr when the guest dies
/// under them instead of exiting normally.
///
/// If `stderr` contains neither an explicit `uncaught target signal N` line
/// nor one of the well-known signal names, `exit_code` is returned
/// unchanged — notably including `-1`, the case this decoding exists for.
pub fn decode_emulator_signal(stderr: &str, exit_code: i32) -> i32 {
    if let Some(pos) = stderr.find("uncaught target signal ") {
        let rest = &stderr[pos + "uncaught target signal ".len()..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(signo) = digits.parse::<i32>() {
            return 128 + signo;
        }
    }
    for (name, signo) in WELL_KNOWN_SIGNALS {
        if stderr.contains(name) {
            return 128 + signo;
        }
    }
    exit_code
}

/// Wait (blocking) for a raw child pid, returning a [`WaitStatus`] — used by
/// components that manage a pid without going through [`std::process::Child`]
/// (none currently do, but this keeps the nix dependency's surface honest
/// with how the rest of this crate decodes process outcomes).
#[allow(dead_code)]
pub(crate) fn waitpid_status(pid: Pid) -> Result<WaitStatus> {
    Ok(nix::sys::wait::waitpid(pid, None).map_err(|e| {
        crate::error::FuzzError::IllegalState(format!("waitpid failed: {e}"))
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_explicit_signal_number() {
        let stderr = "qemu: uncaught target signal 11 (Segmentation fault) - core dumped\n";
        assert_eq!(decode_emulator_signal(stderr, -1), 139);
    }

    #[test]
    fn decodes_well_known_names() {
        assert_eq!(decode_emulator_signal("Aborted", -1), 134);
        assert_eq!(decode_emulator_signal("Illegal instruction", -1), 132);
        assert_eq!(decode_emulator_signal("Bus error", -1), 135);
        assert_eq!(
            decode_emulator_signal("Floating point exception", -1),
            136
        );
    }

    #[test]
    fn leaves_exit_code_unchanged_when_no_pattern_matches() {
        assert_eq!(decode_emulator_signal("nothing interesting here", -1), -1);
        assert_eq!(decode_emulator_signal("nothing interesting here", 0), 0);
    }

    #[test]
    fn runs_a_real_command_and_captures_output() {
        let out = run(
            Path::new("/bin/echo"),
            &["hello".to_string()],
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(!out.timed_out);
        assert_eq!(out.stdout_string().trim(), "hello");
    }

    #[test]
    fn times_out_a_hanging_command() {
        let out = run(
            Path::new("/bin/sleep"),
            &["5".to_string()],
            Duration::from_millis(100),
        )
        .unwrap();
        assert!(out.timed_out);
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn non_zero_exit_is_not_an_error() {
        let out = run(Path::new("/bin/false"), &[], Duration::from_secs(5)).unwrap();
        assert_ne!(out.exit_code, 0);
        assert!(!out.timed_out);
    }
}
