//! Write-side device protocol driver.
//!
//! Drives one connected device through the flashing sequence: unlock,
//! checksum-region init, chunked image write, checksum finalise and reboot.
//! All I/O goes through the [`Link`] trait; progress and status surface
//! through the [`Reporter`].

use std::thread;
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::event::Reporter;
use crate::frame;
use crate::image::{AdsImage, CHECKSUM_OFFSET};
use crate::transport::Link;

/// Bytes per write chunk.
pub const CHUNK_LEN: usize = 192;

/// Attempts per chunk before the job is failed.
pub const CHUNK_ATTEMPTS: usize = 5;

/// ACK window for one chunk.
pub const CHUNK_ACK_TIMEOUT: Duration = Duration::from_millis(1500);

/// Pause before retransmitting an unacknowledged chunk.
const CHUNK_RETRY_GAP: Duration = Duration::from_millis(200);

/// Inter-chunk pacing.
const CHUNK_GAP: Duration = Duration::from_millis(50);

/// Unlock attempts before giving up.
pub const UNLOCK_ATTEMPTS: usize = 3;

/// ACK window for the unlock command.
const UNLOCK_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// Pause between unlock attempts.
const UNLOCK_RETRY_GAP: Duration = Duration::from_millis(500);

/// Settle time after a successful unlock or checksum init.
const POST_CMD_SETTLE: Duration = Duration::from_millis(200);

/// ACK window for the checksum-region init chunk.
const INIT_ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// ACK window for the checksum finalise chunk.
const FINALIZE_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Number of reboot frames sent back to back.
const REBOOT_REPEAT: usize = 3;

/// Spacing between reboot frames.
const REBOOT_GAP: Duration = Duration::from_millis(200);

/// Put the device into engineering mode.
///
/// Shared by the burn and verify phases; engineering mode does not survive
/// the post-write reboot, so the verifier unlocks again.
pub fn unlock_device<L: Link>(
    link: &mut L,
    reporter: &Reporter,
    port: &str,
    mac: &str,
) -> Result<()> {
    for attempt in 1..=UNLOCK_ATTEMPTS {
        link.reset_buffers();
        link.send_cmd(frame::TARGET_DEVICE, &frame::unlock_payload())?;
        if link.wait_for_ack(UNLOCK_ACK_TIMEOUT).is_ok() {
            debug!("[{port}] unlocked {mac} on attempt {attempt}");
            thread::sleep(POST_CMD_SETTLE);
            return Ok(());
        }
        if attempt < UNLOCK_ATTEMPTS {
            reporter.log(port, mac, format!("unlock not acknowledged, retry {attempt}/{UNLOCK_ATTEMPTS}"));
            thread::sleep(UNLOCK_RETRY_GAP);
        }
    }
    Err(Error::Timeout("unlock not acknowledged".into()))
}

/// One device flashing session over a connected link.
pub struct Burner<'a, L: Link> {
    link: &'a mut L,
    image: &'a AdsImage,
    reporter: &'a Reporter,
    port: &'a str,
    mac: &'a str,
}

impl<'a, L: Link> Burner<'a, L> {
    /// Create a session. The link may or may not be connected yet.
    pub fn new(
        link: &'a mut L,
        image: &'a AdsImage,
        reporter: &'a Reporter,
        port: &'a str,
        mac: &'a str,
    ) -> Self {
        Self {
            link,
            image,
            reporter,
            port,
            mac,
        }
    }

    /// Run the connect handshake towards this session's device.
    pub fn connect(&mut self) -> Result<()> {
        self.reporter
            .log(self.port, self.mac, "connecting (hardware reset)...");
        self.link.connect(self.mac)
    }

    /// Unlock the device for engineering commands.
    pub fn unlock(&mut self) -> Result<()> {
        self.reporter.log(self.port, self.mac, "unlocking device...");
        unlock_device(self.link, self.reporter, self.port, self.mac)
    }

    /// Clear the device's running checksum accumulator.
    ///
    /// Writes the `0xFF 0xFF` placeholder into the checksum slots; required
    /// before the chunked write starts.
    pub fn init_checksum_region(&mut self) -> Result<()> {
        self.link.reset_buffers();
        self.link
            .send_data_chunk(CHECKSUM_OFFSET as u32, &[0xFF, 0xFF])?;
        self.link
            .wait_for_ack(INIT_ACK_TIMEOUT)
            .map_err(|_| Error::Timeout("checksum init not acknowledged".into()))?;
        thread::sleep(POST_CMD_SETTLE);
        Ok(())
    }

    /// Transmit the encoded image from `*offset` to the end.
    ///
    /// `*offset` advances in place after every acknowledged chunk and
    /// `checkpoint` is invoked with the new value, so a failure leaves the
    /// caller holding an exact resume position. Progress events fire at
    /// every 5 % boundary and on the final byte.
    pub fn write_image(
        &mut self,
        offset: &mut usize,
        checkpoint: &mut dyn FnMut(usize),
    ) -> Result<()> {
        let total = self.image.encoded_len();
        if total == 0 {
            return Err(Error::InvalidImage("nothing to write".into()));
        }
        self.reporter.log(
            self.port,
            self.mac,
            format!("writing {total} bytes from offset {offset}"),
        );

        let mut last_pct: i32 = -1;
        while *offset < total {
            let end = (*offset + CHUNK_LEN).min(total);
            let chunk = &self.image.encoded[*offset..end];

            let mut acked = false;
            for attempt in 1..=CHUNK_ATTEMPTS {
                self.link.reset_buffers();
                self.link.send_data_chunk(*offset as u32, chunk)?;
                if self.link.wait_for_ack(CHUNK_ACK_TIMEOUT).is_ok() {
                    acked = true;
                    break;
                }
                if attempt >= 2 {
                    self.reporter.log(
                        self.port,
                        self.mac,
                        format!("offset {offset}: ack timeout, resending ({attempt}/{CHUNK_ATTEMPTS})"),
                    );
                }
                thread::sleep(CHUNK_RETRY_GAP);
            }
            if !acked {
                self.reporter.log(
                    self.port,
                    self.mac,
                    format!("write failed: offset {offset} went unacknowledged"),
                );
                return Err(Error::Timeout(format!(
                    "chunk at offset {offset} not acknowledged after {CHUNK_ATTEMPTS} attempts"
                )));
            }

            *offset = end;
            checkpoint(*offset);

            #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
            let pct = (*offset * 100 / total) as i32;
            if (pct > last_pct && pct % 5 == 0) || *offset == total {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                self.reporter.progress(self.port, self.mac, pct as u8);
                self.reporter.log(
                    self.port,
                    self.mac,
                    format!("progress {pct}% ({offset}/{total})"),
                );
                last_pct = pct;
            }

            thread::sleep(CHUNK_GAP);
        }
        Ok(())
    }

    /// Write the real checksum bytes and command a reboot.
    ///
    /// The checksum comes from the raw source file, replacing the `0xFF`
    /// placeholder the encoded stream carried. The reboot command is
    /// fire-and-forget, repeated for reliability.
    pub fn finalize_and_reboot(&mut self) -> Result<()> {
        self.reporter
            .log(self.port, self.mac, "finalising checksum...");
        self.link
            .send_data_chunk(CHECKSUM_OFFSET as u32, self.image.checksum_bytes())?;
        self.link
            .wait_for_ack(FINALIZE_ACK_TIMEOUT)
            .map_err(|_| Error::Timeout("checksum finalise not acknowledged".into()))?;

        self.reporter.log(self.port, self.mac, "sending reboot...");
        for _ in 0..REBOOT_REPEAT {
            let _ = self
                .link
                .send_cmd(frame::TARGET_DEVICE, &frame::reboot_payload());
            thread::sleep(REBOOT_GAP);
        }
        Ok(())
    }

    /// Send one final reboot frame after a verified write.
    pub fn send_final_reboot(&mut self) {
        let _ = self
            .link
            .send_cmd(frame::TARGET_DEVICE, &frame::reboot_payload());
    }
}
