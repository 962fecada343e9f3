//! Dongle transport abstraction.
//!
//! The protocol drivers ([`crate::burner`], [`crate::verifier`]) are written
//! against the [`Link`] trait so they stay I/O-agnostic and testable without
//! hardware:
//!
//! ```text
//! +-------------------+     +-------------------+
//! |  burner/verifier  |     |  burner/verifier  |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    Link trait     |     |    Link trait     |
//! +---------+---------+     +---------+---------+
//!           |                         |
//!           v                         v
//! +---------+---------+     +---------+---------+
//! |    DongleLink     |     |     MockLink      |
//! |   (serialport)    |     |     (tests)       |
//! +-------------------+     +-------------------+
//!       production               unit tests
//! ```
//!
//! One [`Link`] owns one serial port and is bound to at most one BLE peer at
//! a time via [`Link::connect`].

pub mod serial;

use std::time::Duration;

use crate::error::Result;
use crate::frame;

/// Link baud rate. The dongle firmware only speaks 115200 8N1.
pub const BAUD_RATE: u32 = 115_200;

/// Duration the DTR/RTS lines are held low during a hardware reset.
pub const RESET_PULSE: Duration = Duration::from_millis(100);

/// Settle time after the first hardware reset.
///
/// The handshake delays here and below were tuned against production
/// dongles; shortening them makes the unlock step fail intermittently.
pub const RESET_SETTLE: Duration = Duration::from_secs(2);

/// Delay after the stop-scan command.
pub const STOP_SCAN_SETTLE: Duration = Duration::from_millis(200);

/// Time the dongle needs to complete the BLE connection.
pub const CONNECT_SETTLE: Duration = Duration::from_secs(6);

/// Settle time after the mode-switch reset.
pub const MODE_SWITCH_SETTLE: Duration = Duration::from_secs(1);

/// Settle time after entering engineering radio mode.
pub const ENGINEERING_SETTLE: Duration = Duration::from_secs(1);

/// Poll interval while waiting for an ACK byte.
pub const ACK_POLL: Duration = Duration::from_millis(50);

/// Rolling ACK buffer high-water mark.
pub const ACK_BUFFER_CAP: usize = 200;

/// Bytes retained when the rolling ACK buffer overflows.
pub const ACK_BUFFER_KEEP: usize = 50;

/// Maximum bytes returned by a single [`Link::read_response`] call.
pub const READ_CHUNK_CAP: usize = 4096;

/// One dongle serial link.
///
/// Implementations own the port exclusively; the factory guarantees a link
/// is driven by one worker at a time.
pub trait Link: Send {
    /// The port name backing this link.
    fn name(&self) -> &str;

    /// Open the port and run the connect handshake towards `mac`.
    ///
    /// Success means the port opened and the handshake commands were
    /// emitted; whether the peer actually connected surfaces later as ACK
    /// timeouts.
    fn connect(&mut self, mac: &str) -> Result<()>;

    /// Close the port.
    fn disconnect(&mut self);

    /// Frame and send one command. The link's own frame-id counter is
    /// stamped into the frame.
    fn send_cmd(&mut self, target: u8, payload: &[u8]) -> Result<()>;

    /// Send one audio-data chunk at the given image offset.
    fn send_data_chunk(&mut self, offset: u32, data: &[u8]) -> Result<()> {
        self.send_cmd(
            frame::TARGET_DEVICE,
            &frame::write_chunk_payload(offset, data),
        )
    }

    /// Wait until any ACK sentinel shows up in the receive stream.
    fn wait_for_ack(&mut self, timeout: Duration) -> Result<()>;

    /// One bounded read of whatever the port has buffered. An empty vector
    /// means the read window elapsed without data.
    fn read_response(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Flush both I/O buffers.
    fn reset_buffers(&mut self);
}

pub use serial::DongleLink;

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable in-memory link for protocol-flow tests.

    use std::collections::VecDeque;
    use std::time::Duration;

    use super::Link;
    use crate::error::{Error, Result};

    /// Records every command and replays scripted responses.
    ///
    /// Unscripted calls take the happy path: connects succeed, ACKs arrive,
    /// reads return nothing.
    #[derive(Default)]
    pub struct MockLink {
        pub port: String,
        /// Every `(target, payload)` pair sent, in order.
        pub sent: Vec<(u8, Vec<u8>)>,
        /// MACs passed to `connect`, in order.
        pub connects: Vec<String>,
        /// Scripted `connect` outcomes; `true` = success.
        pub connect_script: VecDeque<bool>,
        /// Scripted `wait_for_ack` outcomes; `true` = ACK.
        pub ack_script: VecDeque<bool>,
        /// Scripted `read_response` payloads.
        pub read_script: VecDeque<Vec<u8>>,
        /// Fail the nth `send_cmd` (0-based) with an I/O error.
        pub fail_send_at: Option<usize>,
        pub buffer_resets: usize,
        pub disconnects: usize,
    }

    impl MockLink {
        pub fn new(port: &str) -> Self {
            Self {
                port: port.to_string(),
                ..Self::default()
            }
        }

        /// Queue `n` ACK successes.
        pub fn ack_ok(&mut self, n: usize) {
            self.ack_script.extend(std::iter::repeat(true).take(n));
        }

        /// Queue one ACK timeout.
        pub fn ack_timeout(&mut self) {
            self.ack_script.push_back(false);
        }

        /// Payloads of every data chunk sent (target 0x20, opcode 0xC5).
        pub fn chunk_offsets(&self) -> Vec<u32> {
            self.sent
                .iter()
                .filter(|(target, payload)| {
                    *target == crate::frame::TARGET_DEVICE
                        && payload.first() == Some(&crate::frame::OP_WRITE_CHUNK)
                })
                .map(|(_, payload)| {
                    u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]])
                })
                .collect()
        }
    }

    impl Link for MockLink {
        fn name(&self) -> &str {
            &self.port
        }

        fn connect(&mut self, mac: &str) -> Result<()> {
            self.connects.push(mac.to_string());
            match self.connect_script.pop_front() {
                Some(false) => Err(Error::Serial(serialport::Error::new(
                    serialport::ErrorKind::NoDevice,
                    "scripted connect failure",
                ))),
                _ => Ok(()),
            }
        }

        fn disconnect(&mut self) {
            self.disconnects += 1;
        }

        fn send_cmd(&mut self, target: u8, payload: &[u8]) -> Result<()> {
            if self.fail_send_at == Some(self.sent.len()) {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "scripted send failure",
                )));
            }
            self.sent.push((target, payload.to_vec()));
            Ok(())
        }

        fn wait_for_ack(&mut self, _timeout: Duration) -> Result<()> {
            match self.ack_script.pop_front() {
                Some(false) => Err(Error::Timeout("no ack".into())),
                _ => Ok(()),
            }
        }

        fn read_response(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
            Ok(self.read_script.pop_front().unwrap_or_default())
        }

        fn reset_buffers(&mut self) {
            self.buffer_resets += 1;
        }
    }
}
