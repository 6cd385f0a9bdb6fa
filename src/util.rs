//! Small helpers shared across the engine.

use anyhow::{Error, bail};

/// Split a command string into argv items the way a shell would split on
/// whitespace. Quoting is deliberately not interpreted on the host: quoted
/// tokens are re-parsed by the shell on the device side.
pub fn split_cmd(cmd: &str) -> Vec<String> {
    cmd.split_whitespace().map(str::to_owned).collect()
}

/// Decode child-process output. UTF-8 is the declared encoding on POSIX;
/// on Windows the legacy ANSI code page is tried when UTF-8 fails.
#[cfg(not(windows))]
pub fn decode_output(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(windows)]
pub fn decode_output(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::GBK.decode(bytes);
            decoded.into_owned()
        }
    }
}

pub fn handle_thread_panic<T>(result: std::thread::Result<T>) -> Result<T, Error> {
    match result {
        Ok(x) => Ok(x),
        Err(panic) => {
            let msg = match (
                panic.downcast_ref::<&str>(),
                panic.downcast_ref::<String>(),
            ) {
                (Some(&s), _) => s,
                (_, Some(s)) => s,
                (None, None) => "<No panic message>",
            };
            bail!("Worker thread panic: {msg}");
        }
    }
}
