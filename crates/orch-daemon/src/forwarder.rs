//! The optional unix-socket event forwarder.
//!
//! A second, external consumer (a dashboard, a log aggregator) can attach
//! to a unix socket and receive the same event stream the State Writer and
//! log sink already see, as newline-delimited JSON. The very first line
//! sent on each connection is a `graph` message describing the computed
//! unit DAG and parallelism bound, so a fresh subscriber doesn't have to
//! wait for the next lifecycle event to draw anything.
//!
//! Connection is opportunistic: if nothing is listening yet (or the
//! listener goes away mid-run) the background thread backs off and keeps
//! retrying, the same way [`at_core::events::EventBus`] treats a slow
//! subscriber — the orchestrator itself must never block on this.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use at_core::config::ForwarderConfig;
use at_core::events::{Event, EventHandler};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("failed to spawn event forwarder thread: {0}")]
    Spawn(std::io::Error),
}

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Bridges the event bus onto a reconnecting unix-socket writer.
pub struct ForwarderHandler {
    tx: crossbeam_channel::Sender<Event>,
    dropping: Arc<AtomicBool>,
}

impl ForwarderHandler {
    /// Spawn the background connection-management thread. `graph` is the
    /// one-time payload replayed at the start of every connection.
    pub fn connect(config: ForwarderConfig, graph: Value) -> std::result::Result<Self, ForwarderError> {
        let (tx, rx) = crossbeam_channel::bounded::<Event>(config.buffer_size.max(1));
        let socket_path = config.socket_path.clone();
        std::thread::Builder::new()
            .name("event-forwarder".into())
            .spawn(move || forwarder_loop(socket_path, graph, rx))
            .map_err(ForwarderError::Spawn)?;
        Ok(Self { tx, dropping: Arc::new(AtomicBool::new(false)) })
    }
}

impl EventHandler for ForwarderHandler {
    fn handle(&self, event: &Event) {
        match self.tx.try_send(event.clone()) {
            Ok(()) => {
                self.dropping.store(false, Ordering::Relaxed);
            }
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                if !self.dropping.swap(true, Ordering::Relaxed) {
                    tracing::warn!("event forwarder buffer full, dropping events");
                }
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                tracing::error!("event forwarder thread is gone, event dropped");
            }
        }
    }
}

fn forwarder_loop(socket_path: String, graph: Value, rx: crossbeam_channel::Receiver<Event>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match UnixStream::connect(&socket_path) {
            Ok(mut stream) => {
                backoff = INITIAL_BACKOFF;
                let greeting = serde_json::json!({ "type": "graph", "graph": graph });
                if write_line(&mut stream, &greeting).is_err() {
                    std::thread::sleep(backoff);
                    continue;
                }
                if !drain_into(&mut stream, &rx) {
                    return;
                }
            }
            Err(_) => {
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

/// Forward events onto `stream` until it breaks (reconnect) or the channel
/// is disconnected (shutdown; returns `false` to stop the loop entirely).
fn drain_into(stream: &mut UnixStream, rx: &crossbeam_channel::Receiver<Event>) -> bool {
    loop {
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(event) => {
                if write_line(stream, &event).is_err() {
                    return true;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return false,
        }
    }
}

fn write_line(stream: &mut UnixStream, value: &impl serde::Serialize) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    line.push('\n');
    stream.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::os::unix::net::UnixListener;

    #[test]
    fn sends_graph_then_events_over_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("forwarder.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let config = ForwarderConfig {
            enabled: true,
            socket_path: socket_path.to_string_lossy().into_owned(),
            buffer_size: 16,
        };
        let graph = serde_json::json!({ "units": ["a", "b"], "parallelism": 2 });
        let handler = ForwarderHandler::connect(config, graph).unwrap();

        let (stream, _) = listener.accept().unwrap();
        let mut reader = BufReader::new(stream);

        handler.handle(&Event::for_unit(at_core::events::EventKind::UnitStarted, "a"));

        let mut first = String::new();
        reader.read_line(&mut first).unwrap();
        assert!(first.contains("\"type\":\"graph\""));

        let mut second = String::new();
        reader.read_line(&mut second).unwrap();
        assert!(second.contains("unit_started"));
    }
}
