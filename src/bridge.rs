//! Typed client for the debug bridge command-line tool.
//!
//! Every operation builds an argv vector of the form
//! `[bridge, -H host?, -P port?, -s serial?, subcommand...]` and runs it
//! through the process runner. The `-s` selector is included only for
//! subcommands that target a device. The bridge server daemon itself is
//! process-wide and is started implicitly by the tool when needed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use image::RgbaImage;
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;

use crate::error::{
    BridgeError, InstallFailure, NotFound, RectOverflow, ShellExit, UnsupportedPlatform,
};
use crate::runner;
use crate::util::decode_output;

/// Device path the raw screencap fallback writes to before pulling.
const RAW_CAP_DEVICE_PATH: &str = "/data/local/tmp/tapcap.raw";

/// Map of host platforms to the packaged bridge executable, keyed by
/// `os-machine` with a fallback to `os` alone.
static BRIDGE_BINARIES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from_iter([
        ("Windows", "static/adb/windows/adb.exe"),
        ("Darwin", "static/adb/mac/adb"),
        ("Linux", "static/adb/linux/adb"),
        ("Linux-x86_64", "static/adb/linux/adb"),
        ("Linux-armv7l", "static/adb/linux_arm/adb"),
    ])
});

static DEVICE_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.:-]+\t\w+$").unwrap());
static SHELL_EXIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)^(.*)---(\d+)---$").unwrap());
static INSTALL_FAILURE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Failure \[.*?\]").unwrap());

/// Root directory for files packaged alongside the engine: the bridge
/// executable and the on-device agent binaries. Anchored to the running
/// executable rather than the working directory.
pub fn assets_root() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Locate the packaged bridge executable for the host platform.
pub fn builtin_bridge_path() -> Result<PathBuf> {
    let os = match std::env::consts::OS {
        "windows" => "Windows",
        "macos" => "Darwin",
        "linux" => "Linux",
        other => other,
    };
    let machine = match std::env::consts::ARCH {
        "arm" => "armv7l",
        other => other,
    };
    let keyed = format!("{os}-{machine}");
    let relative = BRIDGE_BINARIES
        .get(keyed.as_str())
        .or_else(|| BRIDGE_BINARIES.get(os))
        .ok_or_else(|| UnsupportedPlatform {
            os: os.to_string(),
            machine: machine.to_string(),
        })?;
    Ok(assets_root().join(relative))
}

/// Identity of one device as seen by one bridge endpoint.
///
/// The serial may be a USB serial (`ABCDEF123`) or `ip:port` for a device
/// attached over the network. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub serial: Option<String>,
    pub host: String,
    pub port: u16,
}

impl DeviceHandle {
    pub fn new(serial: impl Into<String>) -> DeviceHandle {
        DeviceHandle {
            serial: Some(serial.into()),
            host: "127.0.0.1".to_string(),
            port: 5037,
        }
    }

    pub fn with_endpoint(
        serial: Option<String>,
        host: impl Into<String>,
        port: u16,
    ) -> DeviceHandle {
        DeviceHandle {
            serial,
            host: host.into(),
            port,
        }
    }

    /// Whether the serial addresses a network device (`ip:port`).
    pub fn is_network(&self) -> bool {
        self.serial.as_deref().is_some_and(|s| s.contains(':'))
    }

    /// Serial with `:` replaced by `_`, safe for use in filesystem paths.
    pub fn path_safe_serial(&self) -> Option<String> {
        self.serial.as_deref().map(|s| s.replace(':', "_"))
    }
}

/// Thin typed layer over the bridge CLI for one device.
///
/// Cheap to clone; each subsystem of the engine holds its own copy.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    bridge_path: PathBuf,
    handle: DeviceHandle,
    sdk: OnceCell<u32>,
}

impl BridgeClient {
    /// Create a client for `handle`, using the packaged bridge executable
    /// when no explicit path is given.
    ///
    /// `ANDROID_HOME` is removed from the environment so an ambient SDK
    /// installation cannot substitute its own bridge binary.
    pub fn new(handle: DeviceHandle, bridge_path: Option<PathBuf>) -> Result<BridgeClient> {
        let bridge_path = match bridge_path {
            Some(path) => path,
            None => builtin_bridge_path()?,
        };
        unsafe {
            std::env::remove_var("ANDROID_HOME");
        }
        Ok(BridgeClient {
            bridge_path,
            handle,
            sdk: OnceCell::new(),
        })
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    fn build_argv(&self, device: bool, args: &[&str]) -> Result<Vec<String>> {
        let mut argv = vec![self.bridge_path.to_string_lossy().into_owned()];
        if self.handle.host != "127.0.0.1" && self.handle.host != "localhost" {
            argv.push("-H".to_string());
            argv.push(self.handle.host.clone());
        }
        if self.handle.port != 5037 {
            argv.push("-P".to_string());
            argv.push(self.handle.port.to_string());
        }
        if device {
            let serial = self
                .handle
                .serial
                .as_deref()
                .context("no device serial set on this handle")?;
            argv.push("-s".to_string());
            argv.push(serial.to_string());
        }
        argv.extend(args.iter().map(|s| s.to_string()));
        Ok(argv)
    }

    /// Run a bridge subcommand and return its raw stdout.
    pub fn cmd_bytes(
        &self,
        args: &[&str],
        device: bool,
        timeout: Option<Duration>,
        skip_error: bool,
    ) -> Result<Vec<u8>> {
        let argv = self.build_argv(device, args)?;
        log::debug!("bridge {}", argv[1..].join(" "));
        let output = runner::run_checked(&argv, timeout, skip_error)?;
        Ok(output.stdout)
    }

    /// Run a bridge subcommand and return decoded stdout.
    pub fn cmd(&self, args: &[&str], device: bool) -> Result<String> {
        Ok(decode_output(&self.cmd_bytes(args, device, None, false)?))
    }

    /// Launch a bridge subcommand without waiting for it.
    pub fn start_cmd(&self, args: &[&str], device: bool) -> Result<Child> {
        let argv = self.build_argv(device, args)?;
        log::debug!("bridge {} (background)", argv[1..].join(" "));
        runner::spawn(&argv)
    }

    pub fn start_server(&self) -> Result<()> {
        self.cmd(&["start-server"], false).map(drop)
    }

    pub fn kill_server(&self) -> Result<()> {
        self.cmd(&["kill-server"], false).map(drop)
    }

    /// List devices attached to the bridge, optionally filtered by state
    /// (`device`, `offline`).
    pub fn devices(&self, state: Option<&str>) -> Result<Vec<(String, String)>> {
        let output = self.cmd(&["devices"], false)?;
        let mut listed = Vec::new();
        for line in output.lines() {
            let line = line.trim();
            if line.is_empty() || !DEVICE_LINE.is_match(line) {
                continue;
            }
            let (serial, device_state) = line
                .split_once('\t')
                .context("device line without separator")?;
            if state.is_some_and(|wanted| wanted != device_state) {
                continue;
            }
            listed.push((serial.to_string(), device_state.to_string()));
        }
        Ok(listed)
    }

    /// Connect a network device (`ip:port` serial). A no-op for USB serials
    /// and for devices already in the `device` state, unless forced.
    pub fn connect(&self, force: bool) -> Result<()> {
        if !self.handle.is_network() {
            return Ok(());
        }
        if !force && self.get_state()?.as_deref() == Some("device") {
            return Ok(());
        }
        let serial = self.handle.serial.as_deref().unwrap();
        let banner = self.cmd(&["connect", serial], false)?;
        log::info!("{}", banner.trim_end());
        Ok(())
    }

    pub fn disconnect(&self) -> Result<()> {
        if !self.handle.is_network() {
            return Ok(());
        }
        let serial = self.handle.serial.as_deref().unwrap();
        self.cmd(&["disconnect", serial], false)?;
        log::info!("disconnected from {serial}");
        Ok(())
    }

    /// Query `get-state`. An absent device yields `None`; any other failure
    /// is an error.
    pub fn get_state(&self) -> Result<Option<String>> {
        let argv = self.build_argv(true, &["get-state"])?;
        let output = runner::run(&argv, None)?;
        let stdout = output.stdout_text();
        let stderr = output.stderr_text();
        if output.success() {
            Ok(Some(stdout.trim().to_string()))
        } else if stderr.contains("not found") {
            Ok(None)
        } else {
            Err(BridgeError {
                stdout,
                stderr,
                argv,
            }
            .into())
        }
    }

    /// Launch a device shell command without waiting for it.
    pub fn start_shell(&self, args: &[&str]) -> Result<Child> {
        let mut shell_args = vec!["shell"];
        shell_args.extend_from_slice(args);
        self.start_cmd(&shell_args, true)
    }

    pub fn raw_shell_bytes(&self, args: &[&str], skip_error: bool) -> Result<Vec<u8>> {
        let mut shell_args = vec!["shell"];
        shell_args.extend_from_slice(args);
        self.cmd_bytes(&shell_args, true, None, skip_error)
    }

    /// Run a device shell command and decode its output as UTF-8. A decode
    /// failure is downgraded to the debug representation of the bytes.
    pub fn raw_shell(&self, args: &[&str]) -> Result<String> {
        let bytes = self.raw_shell_bytes(args, false)?;
        match String::from_utf8(bytes) {
            Ok(text) => Ok(text),
            Err(bad) => {
                let bytes = bad.into_bytes();
                log::warn!("shell output is not valid UTF-8: {} bytes", bytes.len());
                Ok(format!("{bytes:?}"))
            }
        }
    }

    /// Run a device shell command, honoring its exit code.
    ///
    /// Below SDK 25 the shell transport swallows exit codes, so the code is
    /// routed through a trailing `---$?---` marker and surfaced as
    /// [`ShellExit`] when non-zero.
    pub fn shell(&self, args: &[&str]) -> Result<String> {
        if self.sdk_version()? < 25 {
            let mut wrapped = args.to_vec();
            wrapped.extend_from_slice(&[";", "echo", "---$?---"]);
            let output = self.raw_shell(&wrapped)?;
            let trimmed = output.trim_end();
            let Some(captures) = SHELL_EXIT.captures(trimmed) else {
                log::warn!("shell exit code marker not matched");
                return Ok(trimmed.to_string());
            };
            let stdout = captures.get(1).unwrap().as_str().to_string();
            let returncode: i32 = captures.get(2).unwrap().as_str().parse()?;
            if returncode > 0 {
                return Err(ShellExit {
                    returncode,
                    output: stdout,
                }
                .into());
            }
            Ok(stdout)
        } else {
            self.raw_shell(args)
        }
    }

    /// [`shell`](Self::shell) for a command given as one string, split on
    /// whitespace the way a shell would.
    pub fn shell_cmd(&self, cmd: &str) -> Result<String> {
        let args = crate::util::split_cmd(cmd);
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.shell(&refs)
    }

    /// SDK level of the device, cached for the lifetime of the client.
    pub fn sdk_version(&self) -> Result<u32> {
        self.sdk
            .get_or_try_init(|| {
                let raw = self.getprop("ro.build.version.sdk")?;
                raw.parse()
                    .with_context(|| format!("unparseable SDK level {raw:?}"))
            })
            .copied()
    }

    #[cfg(test)]
    pub(crate) fn seed_sdk(&self, sdk: u32) {
        let _ = self.sdk.set(sdk);
    }

    /// Newline convention used by the device shell: `\r\n` below SDK 24.
    pub fn line_breaker(&self) -> Result<&'static str> {
        Ok(if self.sdk_version()? >= 24 { "\n" } else { "\r\n" })
    }

    pub fn getprop(&self, key: &str) -> Result<String> {
        Ok(self.raw_shell(&["getprop", key])?.trim_end().to_string())
    }

    /// Copy a host file onto the device.
    pub fn push(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let local = local.as_ref();
        if !local.is_file() {
            bail!("file {local:?} does not exist");
        }
        self.cmd_bytes(
            &["push", &local.to_string_lossy(), remote],
            true,
            None,
            false,
        )?;
        Ok(())
    }

    /// Copy a device file to the host.
    pub fn pull(&self, remote: &str, local: impl AsRef<Path>) -> Result<()> {
        self.cmd_bytes(
            &["pull", remote, &local.as_ref().to_string_lossy()],
            true,
            None,
            false,
        )?;
        Ok(())
    }

    /// Install an APK. `Failure [..]` in the output raises [`InstallFailure`]
    /// even when the tool exits successfully.
    pub fn install(&self, apk: impl AsRef<Path>, replace: bool, options: &[&str]) -> Result<String> {
        let apk = apk.as_ref();
        if !apk.is_file() {
            bail!("file {apk:?} does not exist");
        }
        let mut args = vec!["install"];
        if replace {
            args.push("-r");
        }
        args.extend_from_slice(options);
        let apk_arg = apk.to_string_lossy();
        args.push(&apk_arg);
        let output = self.cmd(&args, true)?;
        log::info!("installed {apk:?}");
        if INSTALL_FAILURE.is_match(&output) {
            return Err(InstallFailure { output }.into());
        }
        Ok(output)
    }

    /// Check for a file on the device via `find`.
    pub fn check_file(&self, path: &str, name: &str) -> Result<bool> {
        Ok(!self
            .raw_shell(&["find", path, "-name", name])?
            .trim()
            .is_empty())
    }

    /// Installed path of a package, via `pm path`.
    pub fn path_app(&self, package: &str) -> Result<String> {
        let output = self.shell(&["pm", "path", package]).unwrap_or_default();
        output
            .lines()
            .find_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .ok_or_else(|| NotFound::new(format!("package {package}")).into())
    }

    /// List installed packages, optionally third-party only.
    pub fn list_app(&self, third_only: bool) -> Result<Vec<String>> {
        let mut args = vec!["pm", "list", "packages"];
        if third_only {
            args.push("-3");
        }
        let output = self.shell(&args)?;
        Ok(output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("package:"))
            .map(str::to_string)
            .collect())
    }

    /// Start an app, either by explicit activity or through the launcher.
    pub fn start_app(&self, package: &str, activity: Option<&str>) -> Result<()> {
        match activity {
            Some(activity) => {
                let component = format!("{package}/{package}.{activity}");
                self.shell(&["am", "start", "-n", &component])?;
            }
            None => {
                self.shell(&[
                    "monkey",
                    "-p",
                    package,
                    "-c",
                    "android.intent.category.LAUNCHER",
                    "1",
                ])?;
            }
        }
        log::info!("started app {package}");
        Ok(())
    }

    /// Package name of the app holding window focus.
    pub fn get_foreground_app(&self) -> Result<String> {
        let args = [
            "dumpsys", "window", "windows", "|", "grep", "mCurrentFocus", "|", "cut", "-d'/'",
            "-f1", "|", "rev", "|", "cut", "-d' '", "-f1", "|", "rev",
        ];
        Ok(self.raw_shell(&args)?.trim().to_string())
    }

    /// Snapshot of `ps` output, filtered by pid or by name.
    pub fn process_status(
        &self,
        pid: Option<u32>,
        name: Option<&str>,
    ) -> Result<Vec<BTreeMap<String, String>>> {
        let pid_arg;
        let name_arg;
        let args: Vec<&str> = match (pid, name) {
            (Some(pid), _) => {
                pid_arg = pid.to_string();
                vec!["ps", "-x", &pid_arg]
            }
            (None, Some(name)) => {
                name_arg = format!("\"{name}\"");
                vec!["ps", "|", "grep", "-w", &name_arg]
            }
            (None, None) => vec!["ps"],
        };
        let output = self.raw_shell_bytes(&args, true)?;
        let entries = split_process_status(&decode_output(&output));
        if entries.is_empty() {
            log::debug!("no process matched pid={pid:?} name={name:?}");
        }
        Ok(entries)
    }

    /// Kill a process by pid or by name. Returns false when no process
    /// matched.
    pub fn kill_process(&self, pid: Option<u32>, name: Option<&str>) -> Result<bool> {
        let matched = self.process_status(pid, name)?;
        let Some(entry) = matched.first() else {
            return Ok(false);
        };
        let Some(pid) = entry.get("PID") else {
            return Ok(false);
        };
        self.raw_shell_bytes(&["kill", pid], true)?;
        log::info!(
            "killed pid {pid} ({})",
            entry.get("NAME").map(String::as_str).unwrap_or("?")
        );
        Ok(true)
    }

    /// Screenshot through plain `screencap`, without any capture agent.
    ///
    /// The raw RGBA dump is staged on the device, pulled into
    /// `<workdir>/<serial with ':' → '_'>/tmp.raw` and deleted once read.
    /// An optional `(x, y, width, height)` sub-rectangle is cropped out;
    /// rectangles outside the screen raise [`RectOverflow`].
    pub fn raw_screencap(&self, rect: Option<(u32, u32, u32, u32)>) -> Result<RgbaImage> {
        let serial_tag = self
            .handle
            .path_safe_serial()
            .context("no device serial set on this handle")?;
        self.raw_shell_bytes(&["screencap", RAW_CAP_DEVICE_PATH], false)?;
        self.raw_shell_bytes(&["chmod", "755", RAW_CAP_DEVICE_PATH], true)?;

        let host_dir = PathBuf::from(&serial_tag);
        fs::create_dir_all(&host_dir)?;
        let host_path = host_dir.join("tmp.raw");
        self.pull(RAW_CAP_DEVICE_PATH, &host_path)?;
        let raw = fs::read(&host_path);
        // The staging file must not outlive the call, whatever happens next.
        let _ = fs::remove_file(&host_path);
        let raw = raw?;

        let image = decode_raw_screencap(&raw)?;
        match rect {
            None => Ok(image),
            Some((x, y, width, height)) => {
                if x + width > image.width() || y + height > image.height() {
                    return Err(RectOverflow {
                        x,
                        y,
                        width,
                        height,
                        screen_width: image.width(),
                        screen_height: image.height(),
                    }
                    .into());
                }
                Ok(image::imageops::crop_imm(&image, x, y, width, height).to_image())
            }
        }
    }
}

/// Parse the 12-byte header (width, height, format, little-endian) and RGBA
/// payload produced by `screencap` without `-p`.
fn decode_raw_screencap(raw: &[u8]) -> Result<RgbaImage> {
    if raw.len() < 12 {
        bail!("raw screencap too short: {} bytes", raw.len());
    }
    let width = u32::from_le_bytes(raw[0..4].try_into().unwrap());
    let height = u32::from_le_bytes(raw[4..8].try_into().unwrap());
    let expected = 12 + (width as usize) * (height as usize) * 4;
    if raw.len() < expected {
        bail!(
            "raw screencap truncated: {} of {} bytes for {}x{}",
            raw.len(),
            expected,
            width,
            height
        );
    }
    RgbaImage::from_raw(width, height, raw[12..expected].to_vec())
        .context("raw screencap buffer mismatch")
}

/// Split `ps` output into one column map per process, keyed by the header
/// row. Overlong rows fold their tail into the final column, which carries
/// the process name.
fn split_process_status(output: &str) -> Vec<BTreeMap<String, String>> {
    let mut lines = output.lines().filter(|line| !line.trim().is_empty());
    let Some(header) = lines.next() else {
        return Vec::new();
    };
    let columns: Vec<&str> = header.split_whitespace().collect();
    if !columns.iter().any(|c| *c == "PID") {
        return Vec::new();
    }
    let mut entries = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < columns.len() {
            continue;
        }
        let mut entry = BTreeMap::new();
        for (index, column) in columns.iter().enumerate() {
            let value = if index == columns.len() - 1 {
                fields[index..].join(" ")
            } else {
                fields[index].to_string()
            };
            entry.insert(column.to_string(), value);
        }
        // The last header column is the command name whatever it is called.
        let last = columns.last().unwrap().to_string();
        if last != "NAME" {
            if let Some(value) = entry.get(&last).cloned() {
                entry.insert("NAME".to_string(), value);
            }
        }
        entries.push(entry);
    }
    entries
}
