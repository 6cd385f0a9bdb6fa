//! Synthetic touch injection through the on-device touch agent.
//!
//! The agent accepts newline-terminated ASCII commands over its abstract
//! socket and batches contact changes until a commit. Coordinates on the
//! wire are in the digitizer's raw space, so logical display points are
//! rotated into the panel's natural orientation and scaled first.

use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpStream};
use std::process::Child;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::bridge::BridgeClient;
use crate::deploy::{AgentDeployer, AgentKind};
use crate::error::ProtocolError;
use crate::forward::ForwardManager;
use crate::probe::{DeviceProbe, DisplayInfo};

/// Time allowed for a freshly launched agent to bind its abstract socket.
const AGENT_SETTLE: Duration = Duration::from_secs(1);

pub const DEFAULT_PRESSURE: u32 = 50;

/// One command of the agent's wire grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TouchCommand {
    Down { slot: u32, x: u32, y: u32, pressure: u32 },
    Up { slot: u32 },
    Move { slot: u32, x: u32, y: u32, pressure: u32 },
    Commit,
    Wait { millis: u32 },
    Reset,
}

impl fmt::Display for TouchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use TouchCommand::*;
        match self {
            Down { slot, x, y, pressure } => write!(f, "d {slot} {x} {y} {pressure}"),
            Up { slot } => write!(f, "u {slot}"),
            Move { slot, x, y, pressure } => write!(f, "m {slot} {x} {y} {pressure}"),
            Commit => write!(f, "c"),
            Wait { millis } => write!(f, "w {millis}"),
            Reset => write!(f, "r"),
        }
    }
}

/// Capabilities the touch agent announces after accepting a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TouchBanner {
    pub version: u32,
    pub max_contacts: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub max_pressure: u32,
    pub pid: u32,
}

/// Consume the textual banner: a `v` version line, a `^` limits line and a
/// `$` pid line. Reading stops at the pid line or a blank line.
pub fn parse_touch_banner(reader: &mut impl BufRead) -> Result<TouchBanner> {
    let mut version = 0;
    let mut pid = 0;
    let mut limits = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("v") => {
                version = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
            }
            Some("^") => {
                let mut next = || -> Result<u32> {
                    fields
                        .next()
                        .and_then(|v| v.parse().ok())
                        .ok_or_else(|| ProtocolError::new("malformed touch limits line").into())
                };
                limits = Some((next()?, next()?, next()?, next()?));
            }
            Some("$") => {
                pid = fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                break;
            }
            _ => continue,
        }
    }
    let (max_contacts, max_x, max_y, max_pressure) =
        limits.ok_or_else(|| ProtocolError::new("touch banner is missing its limits line"))?;
    Ok(TouchBanner {
        version,
        max_contacts,
        max_x,
        max_y,
        max_pressure,
        pid,
    })
}

/// Map a logical display point onto the digitizer's raw coordinate space.
///
/// `width` and `height` are the logical dimensions at the given rotation;
/// the point is first rotated back into the panel's natural orientation,
/// then scaled into `[0, max]` on each axis.
pub fn transform(
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    rotation: u16,
    max_x: u32,
    max_y: u32,
) -> (u32, u32) {
    let (w, h) = (u64::from(width), u64::from(height));
    let (x, y) = (u64::from(x), u64::from(y));
    let (nx, ny, nat_w, nat_h) = match rotation % 360 {
        90 => (y, w.saturating_sub(x), h, w),
        180 => (w.saturating_sub(x), h.saturating_sub(y), w, h),
        270 => (h.saturating_sub(y), x, h, w),
        _ => (x, y, w, h),
    };
    let scale = |value: u64, extent: u64, max: u32| -> u32 {
        if extent == 0 {
            return 0;
        }
        (value * u64::from(max) / extent).min(u64::from(max)) as u32
    };
    (scale(nx, nat_w, max_x), scale(ny, nat_h, max_y))
}

/// A running touch session: deployed agent, forwarded port and command
/// socket. At most one per device.
pub struct TouchStream {
    client: BridgeClient,
    forwards: ForwardManager,
    display: DisplayInfo,
    banner: TouchBanner,
    socket: Mutex<TcpStream>,
    agent: Option<Child>,
    agent_name: &'static str,
    local_port: u16,
    rotation: AtomicU16,
    natural_width: u32,
    natural_height: u32,
    closed: bool,
}

impl TouchStream {
    /// Deploy the agent if needed, forward a local port to its abstract
    /// socket, launch it and consume its banner.
    pub fn start(client: BridgeClient) -> Result<TouchStream> {
        let deployer = AgentDeployer::new(client.clone());
        deployer.install(AgentKind::Touch)?;

        let probe = DeviceProbe::new(client.clone());
        let display = probe.display_info()?;

        let forwards = ForwardManager::new(client.clone());
        let local_port = forwards.forward_abstract(deployer.socket_name(AgentKind::Touch)?)?;

        let agent_name = deployer.executable_name(AgentKind::Touch)?;
        let device_path = deployer.device_path(AgentKind::Touch)?;
        let agent = client.start_shell(&[&device_path])?;
        // The agent needs a moment to create its abstract socket.
        thread::sleep(AGENT_SETTLE);

        let socket = TcpStream::connect(("127.0.0.1", local_port))
            .with_context(|| format!("touch agent socket on port {local_port}"))?;
        let mut reader = BufReader::new(socket.try_clone()?);
        let banner = parse_touch_banner(&mut reader)?;
        log::info!(
            "touch agent pid {} ready: {} contacts, {}x{} raw space",
            banner.pid,
            banner.max_contacts,
            banner.max_x,
            banner.max_y
        );

        let rotation = display.rotation();
        let (natural_width, natural_height) = if rotation % 180 == 0 {
            (display.width, display.height)
        } else {
            (display.height, display.width)
        };
        Ok(TouchStream {
            client,
            forwards,
            banner,
            socket: Mutex::new(socket),
            agent: Some(agent),
            agent_name,
            local_port,
            rotation: AtomicU16::new(rotation),
            natural_width,
            natural_height,
            display,
            closed: false,
        })
    }

    pub fn banner(&self) -> &TouchBanner {
        &self.banner
    }

    pub fn display_info(&self) -> &DisplayInfo {
        &self.display
    }

    /// Digitizer range to scale into: the agent's own advertised maxima,
    /// falling back to the probed ones.
    fn digitizer_max(&self) -> (u32, u32) {
        let max_x = match self.banner.max_x {
            0 => self.display.max_x.unwrap_or(0),
            advertised => advertised,
        };
        let max_y = match self.banner.max_y {
            0 => self.display.max_y.unwrap_or(0),
            advertised => advertised,
        };
        (max_x, max_y)
    }

    fn transform_point(&self, x: u32, y: u32) -> (u32, u32) {
        let rotation = self.rotation.load(Ordering::Relaxed);
        let (width, height) = if rotation % 180 == 0 {
            (self.natural_width, self.natural_height)
        } else {
            (self.natural_height, self.natural_width)
        };
        let (max_x, max_y) = self.digitizer_max();
        transform(x, y, width, height, rotation, max_x, max_y)
    }

    /// Write commands to the agent in issue order. A `Wait` is echoed to
    /// the agent and also pauses the caller.
    pub fn send(&self, commands: &[TouchCommand]) -> Result<()> {
        let mut socket = self.socket.lock().unwrap();
        for command in commands {
            socket.write_all(format!("{command}\n").as_bytes())?;
            if let TouchCommand::Wait { millis } = command {
                socket.flush()?;
                thread::sleep(Duration::from_millis(u64::from(*millis)));
            }
        }
        socket.flush()?;
        Ok(())
    }

    /// Press a contact down at a logical display point.
    pub fn down(&self, x: u32, y: u32, slot: u32, pressure: u32) -> Result<()> {
        let (x, y) = self.transform_point(x, y);
        self.send(&[TouchCommand::Down { slot, x, y, pressure }])
    }

    /// Lift a contact.
    pub fn up(&self, slot: u32) -> Result<()> {
        self.send(&[TouchCommand::Up { slot }])
    }

    /// Move a held contact to a logical display point.
    pub fn move_to(&self, x: u32, y: u32, slot: u32, pressure: u32) -> Result<()> {
        let (x, y) = self.transform_point(x, y);
        self.send(&[TouchCommand::Move { slot, x, y, pressure }])
    }

    /// Flush all batched contact changes to the screen.
    pub fn commit(&self) -> Result<()> {
        self.send(&[TouchCommand::Commit])
    }

    pub fn wait(&self, millis: u32) -> Result<()> {
        self.send(&[TouchCommand::Wait { millis }])
    }

    /// Release every contact the agent currently tracks.
    pub fn reset(&self) -> Result<()> {
        self.send(&[TouchCommand::Reset])
    }

    /// A full tap: down, commit, hold, up, commit.
    pub fn click(&self, x: u32, y: u32, slot: u32, duration: Duration) -> Result<()> {
        self.down(x, y, slot, DEFAULT_PRESSURE)?;
        self.commit()?;
        self.wait(duration.as_millis() as u32)?;
        self.up(slot)?;
        self.commit()
    }

    /// React to a device rotation: later coordinates are interpreted in the
    /// new logical orientation.
    pub fn update_rotation(&self, degrees: u16) {
        self.rotation.store(degrees % 360, Ordering::Relaxed);
    }

    /// Tear down the session: close the command socket, stop the agent and
    /// release the forwarded port.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.socket.lock().unwrap().shutdown(Shutdown::Both);
        if let Some(mut agent) = self.agent.take() {
            let _ = agent.kill();
            let _ = agent.wait();
        }
        if let Err(error) = self.client.kill_process(None, Some(self.agent_name)) {
            log::debug!("touch agent cleanup: {error}");
        }
        let local = format!("tcp:{}", self.local_port);
        if let Err(error) = self.forwards.remove(Some(&local)) {
            log::warn!("failed to remove forward {local}: {error}");
        }
    }
}

impl Drop for TouchStream {
    fn drop(&mut self) {
        self.close();
    }
}
