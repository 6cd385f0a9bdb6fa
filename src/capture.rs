//! Real-time framebuffer streaming from the on-device capture agent.
//!
//! The agent is launched over the bridge shell, binds an abstract socket on
//! the device, and speaks a simple binary protocol once a TCP connection is
//! relayed to it: a fixed-layout banner, then an endless sequence of
//! length-prefixed JPEG frames.

use std::collections::VecDeque;
use std::io::Read;
use std::net::TcpStream;
use std::process::Child;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use image::RgbImage;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::bridge::BridgeClient;
use crate::deploy::{AgentDeployer, AgentKind};
use crate::error::ProtocolError;
use crate::forward::ForwardManager;
use crate::probe::{DeviceProbe, DisplayInfo, Orientation};

/// Socket read chunk size.
const READ_LEN: usize = 0x4000;

/// Time allowed for a freshly launched agent to bind its abstract socket.
const AGENT_SETTLE: Duration = Duration::from_secs(1);

/// Environment prefix the agent needs to find its shared object.
const LD_PATH: &str = "LD_LIBRARY_PATH=/data/local/tmp";

static JSON_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());
static WM_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"Physical size: (\d+)x(\d+)").unwrap());
static WM_DENSITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"Physical density: (\d+)").unwrap());

bitfield! {
    /// Capability quirks advertised in the capture banner.
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Quirks(u8);
    impl Debug;
    // dumb: frames arrive only on change, not at a steady rate.
    pub bool, dumb, _: 0;
    // always_upright: frames are always in the natural orientation.
    pub bool, always_upright, _: 1;
    // tear: frames may tear.
    pub bool, tear, _: 2;
}

/// Fixed-layout handshake the capture agent emits once per connection.
#[derive(Debug, Clone)]
pub struct CaptureBanner {
    pub version: u8,
    pub length: u8,
    pub pid: u32,
    pub real_width: u32,
    pub real_height: u32,
    pub virtual_width: u32,
    pub virtual_height: u32,
    pub orientation: Orientation,
    pub quirks: Quirks,
}

impl CaptureBanner {
    /// Parse a complete banner. `bytes` must hold at least the 24 header
    /// bytes; anything past the advertised length has been excluded by the
    /// parser.
    fn parse(bytes: &[u8]) -> Result<CaptureBanner> {
        let u32_at = |offset: usize| {
            u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
        };
        let orientation = Orientation::try_from(bytes[22]).map_err(|_| {
            ProtocolError::new(format!("banner orientation {} out of range", bytes[22]))
        })?;
        Ok(CaptureBanner {
            version: bytes[0],
            length: bytes[1],
            pid: u32_at(2),
            real_width: u32_at(6),
            real_height: u32_at(10),
            virtual_width: u32_at(14),
            virtual_height: u32_at(18),
            orientation,
            quirks: Quirks(bytes[23]),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Banner,
    FrameLength,
    FrameBody(usize),
}

/// Incremental parser for the banner + framed JPEG stream.
///
/// Bytes are appended as they arrive from the socket; complete frames are
/// drained out. The banner is parsed once per connection and kept for
/// inspection.
pub struct FrameParser {
    buffer: VecDeque<u8>,
    phase: Phase,
    banner: Option<CaptureBanner>,
}

impl FrameParser {
    pub fn new() -> FrameParser {
        FrameParser {
            buffer: VecDeque::new(),
            phase: Phase::Banner,
            banner: None,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend(bytes.iter());
    }

    pub fn banner(&self) -> Option<&CaptureBanner> {
        self.banner.as_ref()
    }

    /// Drain the next complete JPEG payload, or return `None` when more
    /// data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            match self.phase {
                Phase::Banner => {
                    if self.buffer.len() < 2 {
                        return Ok(None);
                    }
                    let length = self.buffer[1] as usize;
                    if length < 24 {
                        return Err(ProtocolError::new(format!(
                            "banner length {length} below minimum"
                        ))
                        .into());
                    }
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let bytes: Vec<u8> = self.buffer.drain(..length).collect();
                    self.banner = Some(CaptureBanner::parse(&bytes)?);
                    self.phase = Phase::FrameLength;
                }
                Phase::FrameLength => {
                    if self.buffer.len() < 4 {
                        return Ok(None);
                    }
                    let bytes: Vec<u8> = self.buffer.drain(..4).collect();
                    let length = u32::from_le_bytes(bytes.try_into().unwrap());
                    self.phase = Phase::FrameBody(length as usize);
                }
                Phase::FrameBody(length) => {
                    if self.buffer.len() < length {
                        return Ok(None);
                    }
                    let frame: Vec<u8> = self.buffer.drain(..length).collect();
                    self.phase = Phase::FrameLength;
                    if frame.len() < 2 || frame[0] != 0xFF || frame[1] != 0xD8 {
                        return Err(ProtocolError::new(
                            "frame does not start with a JPEG SOI marker",
                        )
                        .into());
                    }
                    return Ok(Some(frame));
                }
            }
        }
    }
}

impl Default for FrameParser {
    fn default() -> FrameParser {
        FrameParser::new()
    }
}

/// Display block the capture agent prints for `-i`.
#[derive(Debug, Clone, Deserialize)]
struct AgentDisplay {
    width: u32,
    height: u32,
    #[serde(default)]
    density: Option<f64>,
    rotation: u16,
}

/// A running capture session: deployed agent, forwarded port, socket and
/// stream parser. At most one per device.
pub struct CaptureStream {
    client: BridgeClient,
    forwards: ForwardManager,
    deployer: AgentDeployer,
    display: DisplayInfo,
    local_port: u16,
    agent: Option<Child>,
    socket: Option<TcpStream>,
    parser: FrameParser,
    closed: bool,
}

impl CaptureStream {
    /// Deploy the agent if needed, forward a local port to its abstract
    /// socket and launch it for the current display geometry.
    pub fn start(client: BridgeClient) -> Result<CaptureStream> {
        let deployer = AgentDeployer::new(client.clone());
        deployer.install(AgentKind::Capture)?;

        let probe = DeviceProbe::new(client.clone());
        let display = match Self::agent_display_info(&client, &deployer, &probe) {
            Ok(display) => display,
            Err(error) => {
                log::debug!("capture agent display query failed ({error}), probing instead");
                probe.display_info()?
            }
        };

        let forwards = ForwardManager::new(client.clone());
        let local_port = forwards.forward_abstract(deployer.socket_name(AgentKind::Capture)?)?;

        let mut stream = CaptureStream {
            client,
            forwards,
            deployer,
            display,
            local_port,
            agent: None,
            socket: None,
            parser: FrameParser::new(),
            closed: false,
        };
        stream.launch_agent()?;
        Ok(stream)
    }

    pub fn display_info(&self) -> &DisplayInfo {
        &self.display
    }

    /// Banner from the current connection, once read.
    pub fn banner(&self) -> Option<&CaptureBanner> {
        self.parser.banner()
    }

    /// Projection argument: `WxH@WxH/R` with R in quarter turns.
    fn geometry(&self) -> String {
        let (w, h) = (self.display.width, self.display.height);
        format!("{w}x{h}@{w}x{h}/{}", u8::from(self.display.orientation))
    }

    fn launch_agent(&mut self) -> Result<()> {
        self.stop_agent();
        let device_path = self.deployer.device_path(AgentKind::Capture)?;
        let geometry = self.geometry();
        log::info!("launching capture agent with projection {geometry}");
        let child = self
            .client
            .start_shell(&[LD_PATH, &device_path, "-P", &geometry])?;
        self.agent = Some(child);
        // The agent needs a moment to create its abstract socket.
        thread::sleep(AGENT_SETTLE);
        Ok(())
    }

    fn stop_agent(&mut self) {
        if let Some(mut child) = self.agent.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.socket = None;
        self.parser = FrameParser::new();
    }

    fn ensure_connected(&mut self) -> Result<()> {
        if self.socket.is_none() {
            let socket = TcpStream::connect(("127.0.0.1", self.local_port))
                .with_context(|| format!("capture agent socket on port {}", self.local_port))?;
            // A fresh connection replays the banner before any frame.
            self.parser = FrameParser::new();
            self.socket = Some(socket);
        }
        Ok(())
    }

    /// Next length-prefixed JPEG payload from the agent.
    pub fn raw_frame(&mut self) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let result = read_frame(self.socket.as_mut().unwrap(), &mut self.parser);
        if result.is_err() {
            // Leave no half-parsed connection behind; the next call starts
            // over with a fresh banner.
            self.socket = None;
        }
        result
    }

    /// Block until the next complete frame arrives, decode the JPEG and
    /// scale it to the queried display dimensions.
    pub fn frame(&mut self) -> Result<RgbImage> {
        let (width, height) = (self.display.width, self.display.height);
        let raw = self.raw_frame()?;
        let decoded = image::load_from_memory_with_format(&raw, image::ImageFormat::Jpeg)
            .context("failed to decode capture frame")?;
        Ok(decoded
            .resize_exact(width, height, image::imageops::FilterType::Triangle)
            .to_rgb8())
    }

    /// React to a device rotation: relaunch the agent with the rotated
    /// projection. A no-op when the orientation is unchanged.
    pub fn update_rotation(&mut self, degrees: u16) -> Result<()> {
        let orientation = Orientation::from_degrees(degrees)?;
        if orientation == self.display.orientation {
            return Ok(());
        }
        self.display.orientation = orientation;
        self.launch_agent()
    }

    /// Display information as reported by the agent itself (`-i`), with the
    /// pixel dimensions the window manager currently drives layered on top.
    fn agent_display_info(
        client: &BridgeClient,
        deployer: &AgentDeployer,
        probe: &DeviceProbe,
    ) -> Result<DisplayInfo> {
        let device_path = deployer.device_path(AgentKind::Capture)?;
        let output = client.raw_shell(&[LD_PATH, &device_path, "-i"])?;
        let agent = parse_agent_display(&output)?;

        let wm_size = client.raw_shell(&["wm", "size"])?;
        let wm_size = WM_SIZE.captures(&wm_size).and_then(|captures| {
            Some((
                captures.get(1)?.as_str().parse().ok()?,
                captures.get(2)?.as_str().parse().ok()?,
            ))
        });
        let wm_density = client.raw_shell(&["wm", "density"])?;
        let wm_density: Option<f64> = WM_DENSITY
            .captures(&wm_density)
            .and_then(|captures| captures.get(1)?.as_str().parse().ok());

        let (max_x, max_y) = probe.digitizer_max()?;
        Ok(merge_display(agent, wm_size, wm_density, max_x, max_y)?)
    }

    /// Tear down the session: kill the agent, drop the socket and release
    /// the forwarded port.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.stop_agent();
        let local = format!("tcp:{}", self.local_port);
        if let Err(error) = self.forwards.remove(Some(&local)) {
            log::warn!("failed to remove forward {local}: {error}");
        }
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        self.close();
    }
}

fn read_frame(socket: &mut TcpStream, parser: &mut FrameParser) -> Result<Vec<u8>> {
    let mut chunk = [0u8; READ_LEN];
    loop {
        if let Some(frame) = parser.next_frame()? {
            return Ok(frame);
        }
        let got = socket.read(&mut chunk)?;
        if got == 0 {
            return Err(ProtocolError::new("capture agent closed the stream").into());
        }
        parser.extend(&chunk[..got]);
    }
}

fn parse_agent_display(output: &str) -> Result<AgentDisplay> {
    let block = JSON_BLOCK
        .find(output)
        .map(|m| m.as_str())
        .unwrap_or(output);
    serde_json::from_str(block).context("unparseable agent display info")
}

fn merge_display(
    agent: AgentDisplay,
    wm_size: Option<(u32, u32)>,
    wm_density: Option<f64>,
    max_x: Option<u32>,
    max_y: Option<u32>,
) -> Result<DisplayInfo> {
    let (width, height) = wm_size.unwrap_or((agent.width, agent.height));
    Ok(DisplayInfo {
        width,
        height,
        physical_width: agent.width,
        physical_height: agent.height,
        density: wm_density.map(|dpi| dpi / 160.0).or(agent.density),
        orientation: Orientation::from_degrees(agent.rotation)?,
        max_x,
        max_y,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use std::net::TcpListener;

    const BANNER: [u8; 24] = [
        0x01, 0x18, 0x00, 0x00, 0x00, 0x00, 0x80, 0x07, 0x00, 0x00, 0x38, 0x04, 0x00, 0x00,
        0x80, 0x07, 0x00, 0x00, 0x38, 0x04, 0x00, 0x00, 0x01, 0x00,
    ];

    #[test]
    fn test_banner_parse() {
        let mut parser = FrameParser::new();
        parser.extend(&BANNER);
        assert!(parser.next_frame().unwrap().is_none());
        let banner = parser.banner().unwrap();
        assert_eq!(banner.version, 1);
        assert_eq!(banner.length, 24);
        assert_eq!(banner.pid, 0);
        assert_eq!((banner.real_width, banner.real_height), (1920, 1080));
        assert_eq!((banner.virtual_width, banner.virtual_height), (1920, 1080));
        assert_eq!(banner.orientation, Orientation::Landscape);
        assert_eq!(banner.quirks, Quirks(0));
    }

    #[test]
    fn test_frame_framing() {
        let mut parser = FrameParser::new();
        parser.extend(&BANNER);
        parser.extend(&[0x05, 0x00, 0x00, 0x00, 0xFF, 0xD8, 0xFF, 0xD9, 0x00]);
        let frame = parser.next_frame().unwrap().unwrap();
        assert_eq!(frame, vec![0xFF, 0xD8, 0xFF, 0xD9, 0x00]);
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_without_soi_is_protocol_error() {
        let mut parser = FrameParser::new();
        parser.extend(&BANNER);
        parser.extend(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x00]);
        let err = parser.next_frame().unwrap_err();
        assert!(err.downcast_ref::<ProtocolError>().is_some());
    }

    #[test]
    fn test_parser_handles_arbitrary_chunking() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&BANNER);
        stream.extend_from_slice(&[0x04, 0x00, 0x00, 0x00, 0xFF, 0xD8, 0x00, 0xD9]);
        stream.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0xFF, 0xD8]);

        // Feed one byte at a time; the same two frames must come out.
        let mut parser = FrameParser::new();
        let mut frames = Vec::new();
        for byte in stream {
            parser.extend(&[byte]);
            if let Some(frame) = parser.next_frame().unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], vec![0xFF, 0xD8, 0x00, 0xD9]);
        assert_eq!(frames[1], vec![0xFF, 0xD8]);
    }

    #[test]
    fn test_quirks_bits() {
        let quirks = Quirks(0b101);
        assert!(quirks.dumb());
        assert!(!quirks.always_upright());
        assert!(quirks.tear());
    }

    #[test]
    fn test_parse_agent_display() {
        let output = "PID: 1234\n{\"id\":0,\"width\":1200,\"height\":1920,\
                      \"xdpi\":254.4,\"ydpi\":254.4,\"size\":8.8,\"density\":2.0,\
                      \"fps\":60.0,\"secure\":true,\"rotation\":90}\n";
        let agent = parse_agent_display(output).unwrap();
        assert_eq!((agent.width, agent.height), (1200, 1920));
        assert_eq!(agent.density, Some(2.0));
        assert_eq!(agent.rotation, 90);
    }

    #[test]
    fn test_merge_display_prefers_window_manager_values() {
        let agent = AgentDisplay {
            width: 1200,
            height: 1920,
            density: Some(2.0),
            rotation: 90,
        };
        let info = merge_display(agent, Some((1080, 1920)), Some(480.0), Some(32767), None)
            .unwrap();
        assert_eq!((info.width, info.height), (1080, 1920));
        assert_eq!((info.physical_width, info.physical_height), (1200, 1920));
        assert_eq!(info.density, Some(3.0));
        assert_eq!(info.orientation, Orientation::Landscape);
        assert_eq!(info.max_x, Some(32767));
    }

    /// End-to-end delivery over a loopback socket: banner, two frames,
    /// decode and resize.
    #[test]
    #[cfg(unix)]
    fn test_frame_delivery_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let mut jpeg = Vec::new();
        let source = RgbImage::from_pixel(4, 4, image::Rgb([200, 30, 30]));
        source
            .write_to(&mut Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
            .unwrap();

        let payload = jpeg.clone();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            socket.write_all(&BANNER).unwrap();
            for _ in 0..2 {
                socket
                    .write_all(&(payload.len() as u32).to_le_bytes())
                    .unwrap();
                socket.write_all(&payload).unwrap();
            }
        });

        let (_dir, bridge_path) = crate::bridge::tests::fake_bridge("exit 0");
        let client = crate::bridge::BridgeClient::new(
            crate::bridge::DeviceHandle::new("emulator-5554"),
            Some(bridge_path),
        )
        .unwrap();
        let mut stream = CaptureStream {
            forwards: ForwardManager::new(client.clone()),
            deployer: AgentDeployer::new(client.clone()),
            client,
            display: DisplayInfo {
                width: 8,
                height: 8,
                physical_width: 8,
                physical_height: 8,
                density: None,
                orientation: Orientation::Portrait,
                max_x: None,
                max_y: None,
            },
            local_port: port,
            agent: None,
            socket: None,
            parser: FrameParser::new(),
            closed: true,
        };

        let first = stream.frame().unwrap();
        assert_eq!((first.width(), first.height()), (8, 8));
        // JPEG is lossy; the dominant channel must still dominate.
        let pixel = first.get_pixel(4, 4);
        assert!(pixel[0] > 150 && pixel[1] < 100);
        let banner = stream.banner().unwrap();
        assert_eq!(banner.real_width, 1920);

        let second = stream.frame().unwrap();
        assert_eq!((second.width(), second.height()), (8, 8));
        server.join().unwrap();
    }
}
