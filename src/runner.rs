//! Child-process plumbing underneath the bridge client.
//!
//! Everything the engine does on the host side funnels through here: the
//! bridge tool is launched with an argv vector, its output streams are
//! drained on reader threads, and bounded waits kill the child on expiry
//! while still reporting whatever output was captured.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::error::{BridgeError, CommandTimeout};
use crate::util::{decode_output, handle_thread_panic};

/// Captured result of a completed child process.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `None` when the child was terminated by a signal.
    pub status: Option<i32>,
}

impl CommandOutput {
    pub fn stdout_text(&self) -> String {
        decode_output(&self.stdout)
    }

    pub fn stderr_text(&self) -> String {
        decode_output(&self.stderr)
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Launch a child process with all three standard streams piped.
///
/// On Windows the child is detached from any console window, as the engine
/// may run inside a GUI host.
pub fn spawn(argv: &[String]) -> Result<Child> {
    let (program, args) = argv.split_first().context("empty argv")?;
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    command
        .spawn()
        .with_context(|| format!("failed to launch {program:?}"))
}

/// Drain a pipe to a buffer on a dedicated thread, so that a timed-out
/// child can still have its partial output collected after the kill.
fn drain(stream: Option<impl Read + Send + 'static>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buffer);
        }
        buffer
    })
}

/// Run a command to completion.
///
/// With a timeout, the child is polled until the deadline; on expiry it is
/// killed, both streams are drained, and a [`CommandTimeout`] carrying the
/// captured output is returned.
pub fn run(argv: &[String], timeout: Option<Duration>) -> Result<CommandOutput> {
    let mut child = spawn(argv)?;
    drop(child.stdin.take());
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = match timeout {
        None => Some(child.wait()?),
        Some(limit) => {
            let deadline = Instant::now() + limit;
            loop {
                if let Some(status) = child.try_wait()? {
                    break Some(status);
                }
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break None;
                }
                thread::sleep(Duration::from_millis(10));
            }
        }
    };

    let stdout = handle_thread_panic(stdout.join())?;
    let stderr = handle_thread_panic(stderr.join())?;

    match status {
        Some(status) => Ok(CommandOutput {
            stdout,
            stderr,
            status: status.code(),
        }),
        None => {
            let timeout = CommandTimeout {
                argv: argv.to_vec(),
                stdout: decode_output(&stdout),
                stderr: decode_output(&stderr),
            };
            log::error!(
                "{timeout}: stdout[{}] stderr[{}]",
                timeout.stdout.trim(),
                timeout.stderr.trim()
            );
            Err(timeout.into())
        }
    }
}

/// Run a command and require a zero exit status.
///
/// A non-zero (or signalled) exit raises [`BridgeError`] unless the caller
/// opted into `skip_error` for idempotent probes.
pub fn run_checked(
    argv: &[String],
    timeout: Option<Duration>,
    skip_error: bool,
) -> Result<CommandOutput> {
    let output = run(argv, timeout)?;
    if !output.success() && !skip_error {
        return Err(BridgeError {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            argv: argv.to_vec(),
        }
        .into());
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    #[cfg(unix)]
    fn test_run_captures_both_streams() {
        let out = run(&argv(&["sh", "-c", "echo front; echo back >&2"]), None).unwrap();
        assert_eq!(out.stdout_text(), "front\n");
        assert_eq!(out.stderr_text(), "back\n");
        assert!(out.success());
    }

    #[test]
    #[cfg(unix)]
    fn test_run_reports_exit_code() {
        let out = run(&argv(&["sh", "-c", "exit 3"]), None).unwrap();
        assert_eq!(out.status, Some(3));
        assert!(!out.success());
    }

    #[test]
    #[cfg(unix)]
    fn test_run_checked_raises_bridge_error() {
        let vector = argv(&["sh", "-c", "echo oops >&2; exit 1"]);
        let err = run_checked(&vector, None, false).unwrap_err();
        let bridge = err.downcast_ref::<BridgeError>().unwrap();
        assert_eq!(bridge.stderr, "oops\n");
        assert_eq!(bridge.argv, vector);

        // skip_error downgrades the same failure to a plain result.
        let out = run_checked(&vector, None, true).unwrap();
        assert_eq!(out.status, Some(1));
    }

    #[test]
    #[cfg(unix)]
    fn test_timeout_kills_and_reports_partial_output() {
        let vector = argv(&["sh", "-c", "echo started; exec sleep 5"]);
        let err = run(&vector, Some(Duration::from_millis(200))).unwrap_err();
        let timeout = err.downcast_ref::<CommandTimeout>().unwrap();
        assert_eq!(timeout.stdout, "started\n");
        assert_eq!(timeout.argv, vector);
    }

    #[test]
    fn test_spawn_rejects_empty_argv() {
        assert!(spawn(&[]).is_err());
    }
}
