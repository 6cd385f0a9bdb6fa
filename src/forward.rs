//! Host↔device port forwarding.
//!
//! The bridge is the single source of truth for the forward table: every
//! read goes to `forward --list`, and nothing is cached on the host.

use std::net::TcpListener;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;

use crate::bridge::BridgeClient;

/// Host port pool used for reservations.
const PORT_RANGE: std::ops::RangeInclusive<u16> = 11111..=20000;

/// Random draws attempted before falling back to an OS-assigned port.
const RESERVE_ATTEMPTS: usize = 64;

static FORWARD_TCP: Lazy<Regex> = Lazy::new(|| Regex::new(r"tcp:(\d+)").unwrap());

/// One live `local ↔ remote` mapping held by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub local: String,
    pub remote: String,
}

/// Creates, lists and removes port forwards for one device.
#[derive(Debug, Clone)]
pub struct ForwardManager {
    client: BridgeClient,
}

impl ForwardManager {
    pub fn new(client: BridgeClient) -> ForwardManager {
        ForwardManager { client }
    }

    /// Reserve a free local TCP port.
    ///
    /// Draws random ports from the shared pool and probes each with a
    /// transient bind. The probe races against other processes, so callers
    /// must still tolerate a bind failure on the actual forward. After a
    /// bounded number of collisions the OS picks an ephemeral port instead.
    pub fn reserve_local_port(&self) -> Result<u16> {
        let host = self.client.handle().host.clone();
        let mut rng = rand::thread_rng();
        for _ in 0..RESERVE_ATTEMPTS {
            let port = rng.gen_range(PORT_RANGE);
            match TcpListener::bind((host.as_str(), port)) {
                Ok(_) => return Ok(port),
                Err(_) => log::debug!("port {port} is in use"),
            }
        }
        let listener = TcpListener::bind((host.as_str(), 0))
            .context("no local port available for forwarding")?;
        Ok(listener.local_addr()?.port())
    }

    /// Current forward table, straight from the bridge.
    pub fn forwards(&self) -> Result<Vec<Forward>> {
        let output = self.client.cmd_bytes(&["forward", "--list"], false, None, true)?;
        let output = crate::util::decode_output(&output);
        let mut listed = Vec::new();
        for line in output.lines() {
            let columns: Vec<&str> = line.split_whitespace().collect();
            if columns.len() != 3 {
                continue;
            }
            listed.push(Forward {
                local: columns[1].to_string(),
                remote: columns[2].to_string(),
            });
        }
        Ok(listed)
    }

    /// Index of the first live forward matching `local` or `remote`.
    /// A `local` match takes precedence within each entry.
    pub fn find(&self, local: Option<&str>, remote: Option<&str>) -> Result<Option<usize>> {
        let listed = self.forwards()?;
        for (index, forward) in listed.iter().enumerate() {
            if local.is_some_and(|l| forward.local == l) {
                return Ok(Some(index));
            }
            if remote.is_some_and(|r| forward.remote == r) {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// Create a forward. Idempotent: an existing mapping for either side is
    /// left untouched. With `no_rebind`, an occupied local port is an error
    /// instead of a silent replacement.
    pub fn forward(&self, local: &str, remote: &str, no_rebind: bool) -> Result<()> {
        if let Some(index) = self.find(Some(local), Some(remote))? {
            let existing = &self.forwards()?[index];
            log::info!("{} {} already forwarded", existing.local, existing.remote);
            return Ok(());
        }
        let mut args = vec!["forward"];
        if no_rebind {
            args.push("--no-rebind");
        }
        args.push(local);
        args.push(remote);
        self.client.cmd_bytes(&args, true, None, false)?;
        log::debug!("forward {local} {remote}");
        Ok(())
    }

    /// Reserve a port and forward it to an abstract socket on the device.
    /// Returns the reserved local port.
    pub fn forward_abstract(&self, name: &str) -> Result<u16> {
        let port = self.reserve_local_port()?;
        let local = format!("tcp:{port}");
        let remote = format!("localabstract:{name}");
        self.forward(&local, &remote, true)?;
        Ok(port)
    }

    /// Local port currently forwarded to the named abstract socket, if any.
    pub fn forwarded_port(&self, name: &str) -> Result<Option<u16>> {
        let remote = format!("localabstract:{name}");
        let Some(index) = self.find(None, Some(&remote))? else {
            return Ok(None);
        };
        let local = &self.forwards()?[index].local;
        let port = FORWARD_TCP
            .captures(local)
            .and_then(|captures| captures.get(1))
            .and_then(|m| m.as_str().parse().ok());
        Ok(port)
    }

    /// Remove one forward, or all of them when `local` is `None`.
    pub fn remove(&self, local: Option<&str>) -> Result<()> {
        let args = match local {
            Some(local) => vec!["forward", "--remove", local],
            None => vec!["forward", "--remove-all"],
        };
        self.client.cmd_bytes(&args, true, None, false)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::DeviceHandle;
    #[cfg(unix)]
    use crate::bridge::tests::fake_bridge;

    #[cfg(unix)]
    fn manager_with(body: &str) -> (tempfile::TempDir, ForwardManager) {
        let (dir, path) = fake_bridge(body);
        let client = BridgeClient::new(DeviceHandle::new("emulator-5554"), Some(path)).unwrap();
        (dir, ForwardManager::new(client))
    }

    #[test]
    fn test_reserve_local_port_within_pool() {
        let client = BridgeClient::new(
            DeviceHandle::new("emulator-5554"),
            Some(std::path::PathBuf::from("/opt/bridge")),
        )
        .unwrap();
        let manager = ForwardManager::new(client);
        let port = manager.reserve_local_port().unwrap();
        assert!(PORT_RANGE.contains(&port) || port >= 1024);
        // The probe socket is released, so the port can be bound again.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    #[cfg(unix)]
    fn test_forwards_parses_three_column_lines() {
        let (_dir, manager) = manager_with(
            "printf 'emulator-5554 tcp:11135 localabstract:minicap\\nemulator-5554 tcp:11200 localabstract:minitouch\\n'",
        );
        let listed = manager.forwards().unwrap();
        assert_eq!(
            listed,
            vec![
                Forward {
                    local: "tcp:11135".to_string(),
                    remote: "localabstract:minicap".to_string(),
                },
                Forward {
                    local: "tcp:11200".to_string(),
                    remote: "localabstract:minitouch".to_string(),
                },
            ]
        );
    }

    #[test]
    #[cfg(unix)]
    fn test_find_prefers_local_match() {
        let (_dir, manager) = manager_with(
            "printf 'x tcp:11135 localabstract:minicap\\nx tcp:11200 localabstract:minitouch\\n'",
        );
        assert_eq!(manager.find(Some("tcp:11200"), None).unwrap(), Some(1));
        assert_eq!(
            manager
                .find(None, Some("localabstract:minitouch"))
                .unwrap(),
            Some(1)
        );
        assert_eq!(manager.find(Some("tcp:9"), Some("localabstract:none")).unwrap(), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_forward_is_idempotent_on_existing_mapping() {
        // The fake bridge lists an existing forward and fails on any other
        // subcommand, so a second forward call must not reach the tool.
        let (_dir, manager) = manager_with(
            r#"if [ "$2" = "--list" ]; then
printf 'x tcp:11135 localabstract:minicap\n'
else
exit 1
fi"#,
        );
        manager
            .forward("tcp:11135", "localabstract:minicap", true)
            .unwrap();
    }

    /// Full round-trip against a stateful fake bridge: reserve, forward,
    /// list (exactly once), recover the port, remove, gone.
    #[test]
    #[cfg(unix)]
    fn test_forward_round_trip() {
        let state_dir = tempfile::tempdir().unwrap();
        let state = state_dir.path().join("forwards");
        let body = format!(
            r#"STATE={state}
case "$*" in
  "forward --list") cat "$STATE" 2>/dev/null; exit 0;;
  *--no-rebind*) echo "emulator-5554 $5 $6" >> "$STATE";;
  *--remove*) grep -v "$5" "$STATE" > "$STATE.tmp" || true; mv "$STATE.tmp" "$STATE";;
  *) exit 1;;
esac"#,
            state = state.display()
        );
        let (_dir, manager) = manager_with(&body);

        let port = manager.reserve_local_port().unwrap();
        assert!(PORT_RANGE.contains(&port) || port >= 1024);
        let local = format!("tcp:{port}");
        manager.forward(&local, "localabstract:minicap", true).unwrap();
        // The second call is a no-op: no new entry, no error.
        manager.forward(&local, "localabstract:minicap", true).unwrap();

        let matching = manager
            .forwards()
            .unwrap()
            .into_iter()
            .filter(|f| f.local == local && f.remote == "localabstract:minicap")
            .count();
        assert_eq!(matching, 1);
        assert_eq!(manager.forwarded_port("minicap").unwrap(), Some(port));

        manager.remove(Some(&local)).unwrap();
        assert_eq!(manager.find(Some(&local), None).unwrap(), None);
    }

    #[test]
    #[cfg(unix)]
    fn test_forwarded_port_recovers_port_number() {
        let (_dir, manager) =
            manager_with("printf 'x tcp:11135 localabstract:minicap\\n'");
        assert_eq!(manager.forwarded_port("minicap").unwrap(), Some(11135));
        assert_eq!(manager.forwarded_port("minitouch").unwrap(), None);
    }
}
