//! Typed failure values carried inside `anyhow::Error`.
//!
//! Most operations in this crate return `anyhow::Result`; the cases a caller
//! may want to distinguish programmatically are represented by the concrete
//! types below and can be recovered with `Error::downcast_ref`.

use std::fmt;

/// The bridge tool exited with a non-zero status.
#[derive(Debug, Clone)]
pub struct BridgeError {
    pub stdout: String,
    pub stderr: String,
    pub argv: Vec<String>,
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bridge command {:?} failed: stdout[{}] stderr[{}]",
            self.argv,
            self.stdout.trim(),
            self.stderr.trim()
        )
    }
}

impl std::error::Error for BridgeError {}

/// A bounded wait on a child process expired. Carries whatever output was
/// captured before the process was killed.
#[derive(Debug, Clone)]
pub struct CommandTimeout {
    pub argv: Vec<String>,
    pub stdout: String,
    pub stderr: String,
}

impl fmt::Display for CommandTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command {:?} timed out", self.argv)
    }
}

impl std::error::Error for CommandTimeout {}

/// A device shell command reported a non-zero exit code through the
/// `---$?---` back-channel used below SDK 25.
#[derive(Debug, Clone)]
pub struct ShellExit {
    pub returncode: i32,
    pub output: String,
}

impl fmt::Display for ShellExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell command exited with code {}", self.returncode)
    }
}

impl std::error::Error for ShellExit {}

/// Package installation reported `Failure [..]` despite a zero exit status.
#[derive(Debug, Clone)]
pub struct InstallFailure {
    pub output: String,
}

impl fmt::Display for InstallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "installation failure: {}", self.output.trim())
    }
}

impl std::error::Error for InstallFailure {}

/// An agent violated its wire protocol (bad banner, bad frame header).
#[derive(Debug, Clone)]
pub struct ProtocolError {
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> ProtocolError {
        ProtocolError {
            message: message.into(),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "protocol error: {}", self.message)
    }
}

impl std::error::Error for ProtocolError {}

/// A package, process or file the caller asked about does not exist.
#[derive(Debug, Clone)]
pub struct NotFound {
    pub what: String,
}

impl NotFound {
    pub fn new(what: impl Into<String>) -> NotFound {
        NotFound { what: what.into() }
    }
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not found: {}", self.what)
    }
}

impl std::error::Error for NotFound {}

/// A sub-rectangle requested from a raw screencap lies outside the screen.
#[derive(Debug, Clone, Copy)]
pub struct RectOverflow {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl fmt::Display for RectOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rect {}x{}+{}+{} exceeds screen {}x{}",
            self.width, self.height, self.x, self.y, self.screen_width, self.screen_height
        )
    }
}

impl std::error::Error for RectOverflow {}

/// No packaged bridge binary exists for the host platform.
#[derive(Debug, Clone)]
pub struct UnsupportedPlatform {
    pub os: String,
    pub machine: String,
}

impl fmt::Display for UnsupportedPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no bridge executable supports this platform ({}-{})",
            self.os, self.machine
        )
    }
}

impl std::error::Error for UnsupportedPlatform {}
