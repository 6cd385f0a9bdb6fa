//! Background watcher for device orientation changes.
//!
//! A dedicated on-device agent prints the orientation quarter-turn value
//! whenever it changes. The watcher owns that process, reads its stdout on
//! a background thread and fans changes out to registered observers. It
//! runs until explicitly stopped; stopping kills the agent, which ends the
//! reader at end-of-file.

use std::io::{BufRead, BufReader, Read};
use std::process::Child;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, bail};

use crate::bridge::BridgeClient;
use crate::deploy::{AgentDeployer, AgentKind};
use crate::probe::Orientation;
use crate::util::handle_thread_panic;

/// Callback invoked on every orientation change. Runs on the watcher
/// thread, serially in registration order, and must not block.
pub type RotationObserver = Box<dyn Fn(Orientation) + Send>;

struct Worker {
    child: Arc<Mutex<Child>>,
    thread: JoinHandle<()>,
}

/// Watches one device's orientation. At most one live reader per device.
pub struct RotationWatcher {
    client: BridgeClient,
    observers: Vec<RotationObserver>,
    worker: Option<Worker>,
    current: Arc<Mutex<Option<Orientation>>>,
}

impl RotationWatcher {
    pub fn new(client: BridgeClient) -> RotationWatcher {
        RotationWatcher {
            client,
            observers: Vec::new(),
            worker: None,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Register an observer. Registration is only possible before the
    /// watcher is started.
    pub fn register(&mut self, observer: impl Fn(Orientation) + Send + 'static) -> Result<()> {
        if self.worker.is_some() {
            bail!("rotation watcher is already running");
        }
        self.observers.push(Box::new(observer));
        Ok(())
    }

    /// Most recent orientation seen, if any event arrived yet.
    pub fn current(&self) -> Option<Orientation> {
        *self.current.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Deploy and launch the watcher agent and begin reading its output.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            bail!("rotation watcher is already running");
        }
        let deployer = AgentDeployer::new(self.client.clone());
        deployer.install(AgentKind::Rotation)?;
        let device_path = deployer.device_path(AgentKind::Rotation)?;

        let mut child = self.client.start_shell(&[&device_path])?;
        let stdout = child
            .stdout
            .take()
            .context("rotation agent has no stdout")?;
        let observers = std::mem::take(&mut self.observers);
        let current = self.current.clone();
        let thread = thread::spawn(move || watch(stdout, observers, current));
        self.worker = Some(Worker {
            child: Arc::new(Mutex::new(child)),
            thread,
        });
        log::info!("rotation watcher started");
        Ok(())
    }

    /// Stop the watcher by killing the agent and joining the reader.
    pub fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        {
            let mut child = worker.child.lock().unwrap();
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Err(error) = handle_thread_panic(worker.thread.join()) {
            log::error!("rotation watcher: {error}");
        }
    }
}

impl Drop for RotationWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Reader loop: one orientation value per line, duplicates collapsed.
/// Errors are logged and end the task without raising into the foreground.
fn watch(
    stdout: impl Read,
    observers: Vec<RotationObserver>,
    current: Arc<Mutex<Option<Orientation>>>,
) {
    let reader = BufReader::new(stdout);
    let mut last = None;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(error) => {
                log::error!("rotation watcher read failed: {error}");
                break;
            }
        };
        // Devices below SDK 24 emit \r\n; trimming covers both conventions.
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let orientation = trimmed
            .parse::<u8>()
            .ok()
            .and_then(|value| Orientation::try_from(value).ok());
        let Some(orientation) = orientation else {
            log::warn!("unexpected rotation watcher line {trimmed:?}");
            continue;
        };
        if last == Some(orientation) {
            continue;
        }
        last = Some(orientation);
        *current.lock().unwrap() = Some(orientation);
        log::info!("device rotated to {}°", orientation.degrees());
        for observer in &observers {
            observer(orientation);
        }
    }
    log::debug!("rotation watcher reader ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::bridge::{DeviceHandle, tests::fake_bridge};
    #[cfg(unix)]
    use std::time::Duration;

    #[cfg(unix)]
    fn watcher_with_script() -> (tempfile::TempDir, RotationWatcher) {
        // The fake agent is already "installed" (find matches), prints a
        // burst of orientation values and then lingers until killed.
        let (dir, path) = fake_bridge(
            r#"while [ "$1" != "shell" ]; do shift; done
shift
case "$*" in
  find*) echo /data/local/tmp/rotationwatcher;;
  */data/local/tmp/rotationwatcher*) printf '0\n1\n1\n3\n'; exec sleep 3;;
  *) exit 1;;
esac"#,
        );
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        client.seed_sdk(26);
        (dir, RotationWatcher::new(client))
    }

    #[test]
    #[cfg(unix)]
    fn test_observers_receive_changes_in_order() {
        let (_dir, mut watcher) = watcher_with_script();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for id in 0..2 {
            let seen = seen.clone();
            watcher
                .register(move |orientation| {
                    seen.lock().unwrap().push((id, orientation));
                })
                .unwrap();
        }
        watcher.start().unwrap();
        assert!(watcher.is_running());

        // The burst arrives quickly; give the reader a moment.
        thread::sleep(Duration::from_millis(500));
        watcher.stop();
        assert!(!watcher.is_running());

        use Orientation::*;
        // The repeated value is collapsed; both observers see each change
        // exactly once, in registration order.
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (0, Portrait),
                (1, Portrait),
                (0, Landscape),
                (1, Landscape),
                (0, LandscapeFlipped),
                (1, LandscapeFlipped),
            ]
        );
        assert_eq!(watcher.current(), Some(LandscapeFlipped));
    }

    #[test]
    #[cfg(unix)]
    fn test_register_after_start_is_rejected() {
        let (_dir, mut watcher) = watcher_with_script();
        watcher.start().unwrap();
        assert!(watcher.register(|_| ()).is_err());
        assert!(watcher.start().is_err());
        watcher.stop();
    }
}
