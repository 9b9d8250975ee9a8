//! Emit Sink
//!
//! Every progress message, failure and reading produced by the scan
//! controller and discovery sessions goes through an [`EmitSink`]. Each
//! emission is a target id, a short label and an optional JSON payload.

use serde::Serialize;
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

/// One line of structured output
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub target: String,
    pub label: String,
    pub payload: Option<Value>,
}

/// Receiver of emissions, shared by all sessions
pub trait EmitSink: Send + Sync {
    fn emit(&self, emission: Emission);
}

/// Helpers available on every sink
pub trait EmitSinkExt: EmitSink {
    fn emit_label(&self, target: &str, label: &str) {
        self.emit(Emission {
            target: target.to_string(),
            label: label.to_string(),
            payload: None,
        });
    }

    fn emit_value<T: Serialize + ?Sized>(&self, target: &str, label: &str, payload: &T) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!("Could not serialize payload for {}: {}", target, e);
                Value::String(e.to_string())
            }
        };
        self.emit(Emission {
            target: target.to_string(),
            label: label.to_string(),
            payload: Some(payload),
        });
    }
}

impl<S: EmitSink + ?Sized> EmitSinkExt for S {}

/// A byte buffer as it appears in emitted JSON:
/// `{"type":"Buffer","data":"<hex>","utf8":"<best effort text>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawBuffer {
    #[serde(rename = "type")]
    kind: &'static str,
    data: String,
    utf8: String,
}

impl RawBuffer {
    pub fn new(bytes: &[u8]) -> Self {
        Self {
            kind: "Buffer",
            data: hex::encode(bytes),
            utf8: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Render an emission as `<target> <label> <json>`; string payloads are not quoted
pub fn format_line(emission: &Emission, pretty: bool) -> String {
    let mut parts = vec![emission.target.clone(), emission.label.clone()];
    match &emission.payload {
        None => {}
        Some(Value::String(s)) => parts.push(s.clone()),
        Some(value) => {
            let json = if pretty {
                serde_json::to_string_pretty(value)
            } else {
                serde_json::to_string(value)
            };
            parts.push(json.unwrap_or_else(|e| e.to_string()));
        }
    }
    parts.join(" ")
}

/// Writes one line per emission to stdout
pub struct StdoutSink {
    pretty: bool,
    lock: Mutex<()>,
}

impl StdoutSink {
    pub fn new(pretty: bool) -> Self {
        Self {
            pretty,
            lock: Mutex::new(()),
        }
    }
}

impl EmitSink for StdoutSink {
    fn emit(&self, emission: Emission) {
        let line = format_line(&emission, self.pretty);
        // Keep multi-line pretty output from interleaving
        let _guard = self.lock.lock();
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{}", line) {
            warn!("Failed to write emission: {}", e);
        }
    }
}

/// Forwards emissions to a channel
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<Emission>,
}

impl ChannelSink {
    pub fn new(sender: mpsc::UnboundedSender<Emission>) -> Self {
        Self { sender }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Emission>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl EmitSink for ChannelSink {
    fn emit(&self, emission: Emission) {
        let _ = self.sender.send(emission);
    }
}
