//! One device session tying the engine's subsystems together.
//!
//! A session owns the bridge client, lazily attaches the capture and touch
//! streams, and wires both into the rotation watcher so they track the
//! device as it turns. Shutdown releases everything in a fixed order:
//! touch socket, capture socket and their forwards, then the watcher.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};

use crate::bridge::{BridgeClient, DeviceHandle};
use crate::capture::CaptureStream;
use crate::probe::DeviceProbe;
use crate::rotation::RotationWatcher;
use crate::touch::TouchStream;

pub struct Session {
    client: BridgeClient,
    capture: Option<Arc<Mutex<CaptureStream>>>,
    touch: Option<Arc<Mutex<TouchStream>>>,
    rotation: Option<RotationWatcher>,
    closed: bool,
}

impl Session {
    /// Create a session for one device. Network serials (`ip:port`) are
    /// connected through the bridge before returning.
    pub fn open(handle: DeviceHandle, bridge_path: Option<PathBuf>) -> Result<Session> {
        let client = BridgeClient::new(handle, bridge_path)?;
        client.connect(false)?;
        Ok(Session {
            client,
            capture: None,
            touch: None,
            rotation: None,
            closed: false,
        })
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    pub fn probe(&self) -> DeviceProbe {
        DeviceProbe::new(self.client.clone())
    }

    /// The capture stream, launched on first use. At most one per device.
    pub fn capture(&mut self) -> Result<Arc<Mutex<CaptureStream>>> {
        if let Some(capture) = &self.capture {
            return Ok(capture.clone());
        }
        let capture = Arc::new(Mutex::new(CaptureStream::start(self.client.clone())?));
        self.capture = Some(capture.clone());
        Ok(capture)
    }

    /// The touch stream, launched on first use. At most one per device.
    pub fn touch(&mut self) -> Result<Arc<Mutex<TouchStream>>> {
        if let Some(touch) = &self.touch {
            return Ok(touch.clone());
        }
        let touch = Arc::new(Mutex::new(TouchStream::start(self.client.clone())?));
        self.touch = Some(touch.clone());
        Ok(touch)
    }

    /// Start watching the device orientation. Streams attached at this
    /// point are re-projected automatically on every rotation; attach them
    /// first.
    pub fn watch_rotation(&mut self) -> Result<()> {
        if self.rotation.is_some() {
            bail!("rotation watcher is already running");
        }
        let mut watcher = RotationWatcher::new(self.client.clone());
        if let Some(capture) = &self.capture {
            let capture = capture.clone();
            watcher.register(move |orientation| {
                if let Err(error) = capture.lock().unwrap().update_rotation(orientation.degrees())
                {
                    log::error!("capture rotation update failed: {error}");
                }
            })?;
        }
        if let Some(touch) = &self.touch {
            let touch = touch.clone();
            watcher.register(move |orientation| {
                touch.lock().unwrap().update_rotation(orientation.degrees());
            })?;
        }
        watcher.start()?;
        self.rotation = Some(watcher);
        Ok(())
    }

    /// Most recent orientation reported by the watcher.
    pub fn orientation(&self) -> Option<crate::probe::Orientation> {
        self.rotation.as_ref().and_then(RotationWatcher::current)
    }

    /// Shut down: touch socket first, then capture socket, each releasing
    /// its forward, then the rotation watcher and its shell pipe.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(touch) = self.touch.take() {
            touch.lock().unwrap().close();
        }
        if let Some(capture) = self.capture.take() {
            capture.lock().unwrap().close();
        }
        if let Some(mut rotation) = self.rotation.take() {
            rotation.stop();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::bridge::tests::fake_bridge;

    #[test]
    #[cfg(unix)]
    fn test_open_and_close_usb_device() {
        // A USB serial needs no bridge interaction to open, and closing an
        // idle session touches nothing.
        let (_dir, path) = fake_bridge("exit 1");
        let mut session = Session::open(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        assert!(session.orientation().is_none());
        session.close();
        session.close();
    }

    #[test]
    #[cfg(unix)]
    fn test_open_connects_network_device() {
        // A network serial is connected up front; already-connected devices
        // are left alone.
        let (_dir, path) = fake_bridge(
            r#"case "$*" in
  *get-state*) echo device;;
  *) exit 1;;
esac"#,
        );
        Session::open(DeviceHandle::new("127.0.0.1:7555"), Some(path)).unwrap();
    }
}
