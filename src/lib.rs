//! Host-side control engine for Android devices.
//!
//! The engine drives a device through the debug bridge command-line tool:
//! it launches the tool as a child process, deploys small native agents to
//! the device, relays TCP connections to their abstract sockets, and speaks
//! their wire protocols to stream the screen and inject touches. A rotation
//! watcher keeps both streams aligned with the device orientation.
//!
//! ```no_run
//! use std::time::Duration;
//! use tapcap::{DeviceHandle, Session};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut session = Session::open(DeviceHandle::new("emulator-5554"), None)?;
//! let capture = session.capture()?;
//! let touch = session.touch()?;
//! session.watch_rotation()?;
//!
//! let frame = capture.lock().unwrap().frame()?;
//! println!("got a {}x{} frame", frame.width(), frame.height());
//! touch.lock().unwrap().click(540, 960, 0, Duration::from_millis(100))?;
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate bitfield;

pub mod bridge;
pub mod capture;
pub mod deploy;
pub mod error;
pub mod forward;
pub mod probe;
pub mod rotation;
pub mod runner;
pub mod session;
pub mod touch;
mod util;

pub use bridge::{BridgeClient, DeviceHandle};
pub use capture::{CaptureBanner, CaptureStream, FrameParser};
pub use deploy::{AgentDeployer, AgentKind};
pub use error::{
    BridgeError, CommandTimeout, InstallFailure, NotFound, ProtocolError, RectOverflow,
    ShellExit, UnsupportedPlatform,
};
pub use forward::{Forward, ForwardManager};
pub use probe::{DeviceProbe, DisplayInfo, Orientation};
pub use rotation::RotationWatcher;
pub use session::Session;
pub use touch::{TouchBanner, TouchCommand, TouchStream};
