//! Serial dongle link backed by the `serialport` crate.

use std::io::{Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use serialport::ClearBuffer;

use crate::error::{Error, Result};
use crate::frame;
use crate::transport::{
    ACK_BUFFER_CAP, ACK_BUFFER_KEEP, ACK_POLL, BAUD_RATE, CONNECT_SETTLE, ENGINEERING_SETTLE,
    Link, MODE_SWITCH_SETTLE, READ_CHUNK_CAP, RESET_PULSE, RESET_SETTLE, STOP_SCAN_SETTLE,
};

/// A USB-to-BLE dongle attached through a serial port.
///
/// The port is opened by [`Link::connect`] and closed by
/// [`Link::disconnect`]; a fresh connect restarts the frame-id counter.
pub struct DongleLink {
    port_name: String,
    port: Option<Box<dyn serialport::SerialPort>>,
    frame_id: u16,
}

impl DongleLink {
    /// Create a link for the given port. Nothing is opened yet.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            port: None,
            frame_id: 0,
        }
    }

    /// Pulse DTR and RTS low for `hold`, then drive them high again.
    ///
    /// Best-effort: a dongle that ignores the modem lines still resets via
    /// the firmware commands that follow.
    fn pulse_reset(&mut self, hold: Duration) {
        let Some(port) = self.port.as_mut() else {
            return;
        };
        trace!("[{}] pulsing DTR/RTS", self.port_name);
        let _ = port.write_data_terminal_ready(false);
        let _ = port.write_request_to_send(false);
        thread::sleep(hold);
        let _ = port.write_data_terminal_ready(true);
        let _ = port.write_request_to_send(true);
    }

    /// Send a handshake command, ignoring write failures.
    ///
    /// The handshake is fire-and-forget; a peer that missed a step shows up
    /// as an ACK timeout on the first real command.
    fn send_handshake_cmd(&mut self, target: u8, payload: &[u8]) {
        if let Err(e) = self.send_cmd(target, payload) {
            trace!("[{}] handshake write failed (ignored): {e}", self.port_name);
        }
    }
}

impl Link for DongleLink {
    fn name(&self) -> &str {
        &self.port_name
    }

    fn connect(&mut self, mac: &str) -> Result<()> {
        let connect_payload = frame::connect_payload(mac)?;

        debug!("[{}] opening port for {mac}", self.port_name);
        let port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(ACK_POLL)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        self.port = Some(port);
        self.frame_id = 0;

        // Hardware reset, then let the dongle firmware come up.
        self.pulse_reset(RESET_PULSE);
        thread::sleep(RESET_SETTLE);
        self.reset_buffers();

        self.send_handshake_cmd(frame::TARGET_DONGLE, &frame::stop_scan_payload());
        thread::sleep(STOP_SCAN_SETTLE);

        self.send_handshake_cmd(frame::TARGET_DONGLE, &connect_payload);
        thread::sleep(CONNECT_SETTLE);

        // Second reset switches the dongle from scan mode to data mode.
        self.pulse_reset(RESET_PULSE);
        thread::sleep(MODE_SWITCH_SETTLE);

        self.send_handshake_cmd(frame::TARGET_RADIO, &frame::engineering_mode_payload());
        thread::sleep(ENGINEERING_SETTLE);

        debug!("[{}] handshake sequence complete", self.port_name);
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.port.take().is_some() {
            debug!("[{}] port closed", self.port_name);
        }
    }

    fn send_cmd(&mut self, target: u8, payload: &[u8]) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::Protocol(format!("{}: port closed", self.port_name)));
        };
        self.frame_id = self.frame_id.wrapping_add(1);
        let packet = frame::build_frame(target, self.frame_id, payload);
        port.write_all(&packet)?;
        port.flush()?;
        Ok(())
    }

    fn wait_for_ack(&mut self, timeout: Duration) -> Result<()> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::Protocol(format!("{}: port closed", self.port_name)));
        };
        port.set_timeout(ACK_POLL)?;

        let deadline = Instant::now() + timeout;
        let mut buffer: Vec<u8> = Vec::with_capacity(ACK_BUFFER_CAP + 64);
        let mut scratch = [0u8; 64];

        while Instant::now() < deadline {
            match port.read(&mut scratch) {
                Ok(n) if n > 0 => {
                    buffer.extend_from_slice(&scratch[..n]);
                    if frame::contains_ack(&buffer) {
                        return Ok(());
                    }
                    if buffer.len() > ACK_BUFFER_CAP {
                        let keep = buffer.len() - ACK_BUFFER_KEEP;
                        buffer.drain(..keep);
                    }
                },
                Ok(_) => {},
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Err(Error::Timeout(format!(
            "no ack within {} ms",
            timeout.as_millis()
        )))
    }

    fn read_response(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let Some(port) = self.port.as_mut() else {
            return Err(Error::Protocol(format!("{}: port closed", self.port_name)));
        };
        port.set_timeout(timeout)?;

        let mut buf = vec![0u8; READ_CHUNK_CAP];
        match port.read(&mut buf) {
            Ok(n) => {
                buf.truncate(n);
                Ok(buf)
            },
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn reset_buffers(&mut self) {
        if let Some(port) = self.port.as_mut() {
            if let Err(e) = port.clear(ClearBuffer::All) {
                warn!("[{}] buffer clear failed: {e}", self.port_name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_on_closed_port_is_an_error() {
        let mut link = DongleLink::new("/dev/null-port");
        assert!(link.send_cmd(frame::TARGET_DEVICE, &[0x00]).is_err());
        assert!(link.wait_for_ack(Duration::from_millis(1)).is_err());
        assert!(link.read_response(Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_disconnect_without_open_is_harmless() {
        let mut link = DongleLink::new("COM-none");
        link.disconnect();
        link.reset_buffers();
        assert_eq!(link.name(), "COM-none");
    }
}
