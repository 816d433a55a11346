//! Unix socket server feeding host signals into the engine
//!
//! Listens on [`crate::ipc::socket_path`] for newline-delimited JSON messages.
//! Each line is deserialized as a [`HostMessage`] and applied to the engine.

use crate::engine::Engine;
use crate::event::HostMessage;
use crate::session::EndReason;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

/// Bind the socket at `path`, removing a stale socket file first.
pub fn bind(path: &Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let listener = UnixListener::bind(path)?;
    info!("IPC server listening on {}", path.display());
    Ok(listener)
}

/// Accept connections until the task is dropped.
///
/// `unloaded` is notified once an `unload` message has torn the engine down.
pub async fn serve(listener: UnixListener, engine: Engine, unloaded: Arc<Notify>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let engine = engine.clone();
                let unloaded = Arc::clone(&unloaded);
                tokio::spawn(async move {
                    let reader = BufReader::new(stream);
                    let mut lines = reader.lines();

                    while let Ok(Some(line)) = lines.next_line().await {
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<HostMessage>(&line) {
                            Ok(msg) => {
                                debug!(?msg, "ipc message");
                                if handle_message(&engine, msg).await {
                                    unloaded.notify_one();
                                }
                            }
                            Err(e) => {
                                trace!("Failed to parse IPC message: {} (line: {})", e, line);
                            }
                        }
                    }
                });
            }
            Err(e) => {
                warn!("Failed to accept socket connection: {}", e);
            }
        }
    }
}

/// Apply one host message. Returns true when it unloaded the engine.
pub async fn handle_message(engine: &Engine, msg: HostMessage) -> bool {
    match msg {
        HostMessage::Track { event, payload } => engine.track(&event, payload),
        HostMessage::Activity { signal } => engine.record_activity(signal),
        HostMessage::Visibility { hidden } => engine.set_visibility(hidden),
        HostMessage::Flush => engine.flush(),
        HostMessage::Unload => {
            return engine.teardown(EndReason::Unload).await.is_some();
        }
    }
    false
}
