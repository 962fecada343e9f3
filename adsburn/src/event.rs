//! Control-channel message types.
//!
//! The controller process drives adsburn over a pair of line-delimited byte
//! streams: one JSON object per line in each direction. Inbound lines are
//! [`Command`]s, outbound lines are [`Event`]s. A second, flag-selected
//! plain-line dialect exists for driving the flasher by hand; both render
//! from the same [`Event`] values.
//!
//! Workers and the factory never print anything themselves. They hold a
//! cloned [`Reporter`] and push events into it; the front-end owns the
//! receiving end and picks the output dialect.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Port label used for events not tied to a specific dongle.
pub const SYSTEM_PORT: &str = "SYSTEM";

/// Inbound control command, one JSON object per line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command")]
pub enum Command {
    /// Configure and start a factory run.
    #[serde(rename = "START")]
    Start {
        /// Path to the audio image file.
        file: String,
        /// Advertised-name substrings identifying target devices.
        target_ids: Vec<String>,
        /// Serial ports of the dongles to use.
        ports: Vec<String>,
    },
    /// Stop the running factory.
    #[serde(rename = "STOP")]
    Stop,
}

/// Outbound event, one JSON object per line.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum Event {
    /// Free-form status line.
    #[serde(rename = "LOG")]
    Log {
        /// Originating dongle port, or [`SYSTEM_PORT`].
        #[serde(skip_serializing_if = "String::is_empty")]
        port: String,
        /// Target device MAC, when the line concerns one.
        #[serde(skip_serializing_if = "String::is_empty")]
        mac: String,
        /// Human-readable message.
        message: String,
    },
    /// Write-progress report for one device.
    #[serde(rename = "PROGRESS")]
    Progress {
        /// Originating dongle port.
        #[serde(skip_serializing_if = "String::is_empty")]
        port: String,
        /// Target device MAC.
        mac: String,
        /// Percentage of the encoded image transmitted, 0..=100.
        pct: u8,
    },
    /// Fatal or operational error.
    #[serde(rename = "ERROR")]
    Error {
        /// Originating dongle port, or [`SYSTEM_PORT`].
        #[serde(skip_serializing_if = "String::is_empty")]
        port: String,
        /// Human-readable message.
        message: String,
    },
}

impl Event {
    /// Render the event in the plain-line dialect.
    ///
    /// `LOG:<message>`, `PROGRESS:<mac>:<pct>`, `ERROR:<message>`.
    pub fn to_plain_line(&self) -> String {
        match self {
            Self::Log { message, .. } => format!("LOG:{message}"),
            Self::Progress { mac, pct, .. } => format!("PROGRESS:{mac}:{pct}"),
            Self::Error { message, .. } => format!("ERROR:{message}"),
        }
    }
}

/// Cloneable sending handle for the event stream.
///
/// Sends never block; a disconnected receiver silently drops events, which
/// only happens during teardown.
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::UnboundedSender<Event>,
}

impl Reporter {
    /// Create a reporter and the receiving end of its event stream.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Emit a LOG event.
    pub fn log(&self, port: &str, mac: &str, message: impl Into<String>) {
        let _ = self.tx.send(Event::Log {
            port: port.to_string(),
            mac: mac.to_string(),
            message: message.into(),
        });
    }

    /// Emit a PROGRESS event.
    pub fn progress(&self, port: &str, mac: &str, pct: u8) {
        let _ = self.tx.send(Event::Progress {
            port: port.to_string(),
            mac: mac.to_string(),
            pct,
        });
    }

    /// Emit an ERROR event.
    pub fn error(&self, port: &str, message: impl Into<String>) {
        let _ = self.tx.send(Event::Error {
            port: port.to_string(),
            message: message.into(),
        });
    }
}
