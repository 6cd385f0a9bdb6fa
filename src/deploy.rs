//! Deployment of the native on-device agent binaries.
//!
//! The host ships prebuilt agents per ABI (and per SDK level for the shared
//! object). Once pushed to `/data/local/tmp` and made executable they stay
//! installed until the device reboots.

use std::path::PathBuf;

use anyhow::{Result, bail};

use crate::bridge::{BridgeClient, assets_root};

/// Directory on the device holding all deployed agents.
pub const AGENT_HOME: &str = "/data/local/tmp";

/// SDK level from which the modern touch agent replaces the classic one.
const MAXTOUCH_MIN_SDK: u32 = 29;

/// The agents the engine knows how to deploy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentKind {
    /// Framebuffer streamer (`minicap` plus its `minicap.so`).
    Capture,
    /// Touch injector (`minitouch`, or `maxtouch` on newer devices).
    Touch,
    /// Orientation reporter.
    Rotation,
}

/// Pushes agent binaries to the device and verifies their presence.
#[derive(Debug, Clone)]
pub struct AgentDeployer {
    client: BridgeClient,
    root: PathBuf,
}

impl AgentDeployer {
    pub fn new(client: BridgeClient) -> AgentDeployer {
        AgentDeployer {
            client,
            root: assets_root(),
        }
    }

    /// Use an explicit directory holding the `android/<abi>/...` tree
    /// instead of the packaged one.
    pub fn with_root(client: BridgeClient, root: impl Into<PathBuf>) -> AgentDeployer {
        AgentDeployer {
            client,
            root: root.into(),
        }
    }

    /// Executable name for an agent on this device.
    pub fn executable_name(&self, kind: AgentKind) -> Result<&'static str> {
        Ok(match kind {
            AgentKind::Capture => "minicap",
            AgentKind::Rotation => "rotationwatcher",
            AgentKind::Touch => {
                if self.client.sdk_version()? >= MAXTOUCH_MIN_SDK {
                    "maxtouch"
                } else {
                    "minitouch"
                }
            }
        })
    }

    /// Abstract socket the agent listens on once launched.
    pub fn socket_name(&self, kind: AgentKind) -> Result<&'static str> {
        Ok(match kind {
            AgentKind::Capture => "minicap",
            AgentKind::Rotation => "scrcpy",
            AgentKind::Touch => self.executable_name(AgentKind::Touch)?,
        })
    }

    /// Path of the agent executable on the device.
    pub fn device_path(&self, kind: AgentKind) -> Result<String> {
        Ok(format!("{AGENT_HOME}/{}", self.executable_name(kind)?))
    }

    fn host_executable(&self, kind: AgentKind) -> Result<PathBuf> {
        let abi = self.client.getprop("ro.product.cpu.abi")?;
        Ok(self
            .root
            .join("android")
            .join(abi)
            .join("bin")
            .join(self.executable_name(kind)?))
    }

    fn host_library(&self) -> Result<PathBuf> {
        let abi = self.client.getprop("ro.product.cpu.abi")?;
        let sdk = self.client.sdk_version()?;
        Ok(self
            .root
            .join("android")
            .join(abi)
            .join("lib")
            .join(format!("android-{sdk}"))
            .join("minicap.so"))
    }

    /// Whether the agent (and its shared object, for capture) is already on
    /// the device.
    pub fn is_installed(&self, kind: AgentKind) -> Result<bool> {
        let name = self.executable_name(kind)?;
        let mut installed = self.client.check_file(AGENT_HOME, name)?;
        if installed && kind == AgentKind::Capture {
            installed = self.client.check_file(AGENT_HOME, "minicap.so")?;
        }
        Ok(installed)
    }

    /// Push the agent to the device, make it executable and verify it
    /// landed. A no-op when already installed.
    pub fn install(&self, kind: AgentKind) -> Result<()> {
        if self.is_installed(kind)? {
            return Ok(());
        }
        let name = self.executable_name(kind)?;
        let executable = self.host_executable(kind)?;
        if !executable.is_file() {
            bail!("no {name} build for this device at {executable:?}");
        }
        let device_path = self.device_path(kind)?;
        self.client.push(&executable, &device_path)?;
        self.client
            .raw_shell_bytes(&["chmod", "0755", &device_path], true)?;
        log::debug!("{name} installed in {device_path}");

        if kind == AgentKind::Capture {
            let library = self.host_library()?;
            if !library.is_file() {
                bail!("no minicap.so build for this device at {library:?}");
            }
            let library_path = format!("{AGENT_HOME}/minicap.so");
            self.client.push(&library, &library_path)?;
            self.client
                .raw_shell_bytes(&["chmod", "0755", &library_path], true)?;
            log::debug!("minicap.so installed in {library_path}");
        }

        if !self.is_installed(kind)? {
            bail!("{name} missing from {AGENT_HOME} after push");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::bridge::{DeviceHandle, tests::fake_bridge};
    #[cfg(unix)]
    use std::fs;

    #[cfg(unix)]
    fn deployer_with(body: &str, root: &std::path::Path) -> (tempfile::TempDir, AgentDeployer) {
        let (dir, path) = fake_bridge(body);
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        client.seed_sdk(26);
        (dir, AgentDeployer::with_root(client, root))
    }

    #[test]
    #[cfg(unix)]
    fn test_touch_agent_tracks_sdk_level() {
        let (_dir, path) = fake_bridge("exit 1");
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        client.seed_sdk(25);
        let deployer = AgentDeployer::new(client);
        assert_eq!(deployer.executable_name(AgentKind::Touch).unwrap(), "minitouch");
        assert_eq!(deployer.socket_name(AgentKind::Touch).unwrap(), "minitouch");

        let (_dir, path) = fake_bridge("exit 1");
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        client.seed_sdk(30);
        let deployer = AgentDeployer::new(client);
        assert_eq!(deployer.executable_name(AgentKind::Touch).unwrap(), "maxtouch");
        assert_eq!(deployer.device_path(AgentKind::Touch).unwrap(), "/data/local/tmp/maxtouch");
    }

    #[test]
    #[cfg(unix)]
    fn test_install_pushes_executable_and_library() {
        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("android/arm64-v8a/bin");
        let lib = root.path().join("android/arm64-v8a/lib/android-26");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&lib).unwrap();
        fs::write(bin.join("minicap"), b"elf").unwrap();
        fs::write(lib.join("minicap.so"), b"elf").unwrap();

        let marker = root.path().join("pushed");
        let body = format!(
            r#"case "$*" in
  *"getprop ro.product.cpu.abi"*) echo arm64-v8a;;
  *push*) touch {marker}; exit 0;;
  *chmod*) exit 0;;
  *find*) if [ -f {marker} ]; then echo /data/local/tmp/minicap; fi;;
  *) exit 1;;
esac"#,
            marker = marker.display()
        );
        let (_dir, deployer) = deployer_with(&body, root.path());
        assert!(!deployer.is_installed(AgentKind::Capture).unwrap());
        deployer.install(AgentKind::Capture).unwrap();
        assert!(deployer.is_installed(AgentKind::Capture).unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn test_install_requires_host_binary() {
        let root = tempfile::tempdir().unwrap();
        let body = r#"case "$*" in
  *"getprop ro.product.cpu.abi"*) echo arm64-v8a;;
  *find*) exit 0;;
  *) exit 1;;
esac"#;
        let (_dir, deployer) = deployer_with(body, root.path());
        let err = deployer.install(AgentKind::Rotation).unwrap_err();
        assert!(err.to_string().contains("rotationwatcher"));
    }
}
