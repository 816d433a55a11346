//! IPC utilities for Unix socket communication
//!
//! Hosts talk to the daemon with newline-delimited JSON [`HostMessage`]s.
//! This module provides the shared socket path and the client side used by
//! `trail send`.

use crate::event::HostMessage;
use std::io::{BufRead, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default socket path for the daemon.
pub fn socket_path() -> PathBuf {
    std::env::temp_dir().join("trail.sock")
}

/// Forward every valid message line from `input` to the daemon socket.
///
/// Blank lines are skipped; lines that do not parse as a [`HostMessage`] are
/// reported on stderr and skipped. Returns the number of messages sent.
pub fn forward_lines(path: &Path, input: impl BufRead) -> std::io::Result<usize> {
    let mut stream = UnixStream::connect(path)?;
    let mut sent = 0;
    for line in input.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<HostMessage>(line) {
            Ok(msg) => {
                let json = serde_json::to_string(&msg)?;
                writeln!(stream, "{json}")?;
                sent += 1;
            }
            Err(e) => {
                eprintln!("skipping invalid message: {e}");
            }
        }
    }
    stream.flush()?;
    debug!(sent, "forwarded host messages");
    Ok(sent)
}
