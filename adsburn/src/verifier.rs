//! Read-back verification of a flashed device.
//!
//! After the device reboots with its new image, the verifier reconstructs
//! the 606-byte header from paged read responses and compares the track
//! table against the local file, slot by slot.

use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::burner::unlock_device;
use crate::error::{Error, Result};
use crate::event::Reporter;
use crate::frame::{self, FrameScanner, OP_READ_DATA};
use crate::image::{AdsImage, HEADER_LEN, HEADER_MAGIC, MAX_TRACKS, TrackTable, parse_header};
use crate::transport::Link;

/// Bytes requested per paged read.
pub const READ_PAGE_LEN: usize = 192;

/// Slots covered by the comparison when neither table has an occupied slot.
const COMPARE_DEFAULT_SPAN: u8 = 10;

/// Wall-clock limits of the paged read.
///
/// The defaults match the device's pacing; tests shrink them.
#[derive(Debug, Clone)]
pub struct ReadTimings {
    /// Link settle time between reconnect and the first command.
    pub settle: Duration,
    /// How long one read request may take to produce data before it is
    /// re-sent.
    pub chunk_window: Duration,
    /// Overall deadline for assembling the full header.
    pub total_deadline: Duration,
    /// Pacing between a successful request and the next one.
    pub request_gap: Duration,
    /// Poll interval on the response stream.
    pub poll: Duration,
}

impl Default for ReadTimings {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(10),
            chunk_window: Duration::from_millis(2500),
            total_deadline: Duration::from_secs(25),
            request_gap: Duration::from_millis(100),
            poll: Duration::from_millis(50),
        }
    }
}

/// Result of a completed verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Device track table matches the local file.
    Match,
    /// Device content differs; the image must be rewritten from scratch.
    Mismatch,
}

/// Compare the device's track table against the local image.
///
/// Returns `Err` when the device could not be read at all (unlock or paged
/// read failure) — the caller keeps its checkpoint and releases the job.
/// `Ok(Mismatch)` means the read succeeded but the content differs.
pub fn verify_device<L: Link>(
    link: &mut L,
    image: &AdsImage,
    reporter: &Reporter,
    port: &str,
    mac: &str,
    timings: &ReadTimings,
) -> Result<VerifyOutcome> {
    reporter.log(port, mac, "verifying track table...");
    thread::sleep(timings.settle);

    let local = parse_header(image.header())?;

    reporter.log(port, mac, "unlocking for read-back...");
    unlock_device(link, reporter, port, mac)?;

    reporter.log(port, mac, "reading device header (192 bytes/page)...");
    let device = read_device_header(link, reporter, port, mac, timings)?
        .ok_or_else(|| Error::Timeout("device header read incomplete".into()))?;

    if compare_tracks(&local, &device, reporter, port, mac) {
        Ok(VerifyOutcome::Match)
    } else {
        Ok(VerifyOutcome::Mismatch)
    }
}

/// Reassemble the device's header from paged read responses.
///
/// Each request asks for up to [`READ_PAGE_LEN`] bytes; the device answers
/// with one or more frames whose payload starts with [`OP_READ_DATA`]. The
/// wait loop breaks as soon as a request produced any data — the device
/// paces itself, so partial answers are normal and the next request simply
/// continues from the advanced offset. A stalled request is re-sent with
/// the same offset until the overall deadline runs out.
///
/// Returns `Ok(None)` when the deadline expired before a full header (with
/// its magic) was assembled.
pub fn read_device_header<L: Link>(
    link: &mut L,
    reporter: &Reporter,
    port: &str,
    mac: &str,
    timings: &ReadTimings,
) -> Result<Option<TrackTable>> {
    let mut assembled: Vec<u8> = Vec::with_capacity(1024);
    let mut scanner = FrameScanner::new();
    let deadline = Instant::now() + timings.total_deadline;
    let mut request_offset: u32 = 0;

    while assembled.len() < HEADER_LEN {
        if Instant::now() > deadline {
            reporter.log(port, mac, "read-back deadline expired");
            break;
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by READ_PAGE_LEN
        let request_len = (HEADER_LEN - assembled.len()).min(READ_PAGE_LEN) as u16;
        link.reset_buffers();
        link.send_cmd(
            frame::TARGET_DEVICE,
            &frame::read_page_payload(request_offset, request_len),
        )?;

        let chunk_deadline = Instant::now() + timings.chunk_window;
        let mut advanced = false;
        while Instant::now() < chunk_deadline {
            let data = match link.read_response(timings.poll) {
                Ok(data) => data,
                Err(_) => continue,
            };
            if data.is_empty() {
                continue;
            }
            scanner.push(&data);
            while let Some(payload) = scanner.next_payload() {
                if payload.first() == Some(&OP_READ_DATA) {
                    let body = &payload[1..];
                    assembled.extend_from_slice(body);
                    request_offset += body.len() as u32;
                    advanced = true;
                }
            }
            if advanced {
                break;
            }
        }

        if advanced {
            thread::sleep(timings.request_gap);
        } else {
            reporter.log(
                port,
                mac,
                format!("read stalled, re-requesting offset {request_offset}"),
            );
        }
    }

    if let Some(at) = assembled
        .windows(HEADER_MAGIC.len())
        .position(|w| w == HEADER_MAGIC)
    {
        if assembled.len() >= at + HEADER_LEN {
            reporter.log(
                port,
                mac,
                format!("read complete ({} bytes), parsing...", assembled.len()),
            );
            return parse_header(&assembled[at..at + HEADER_LEN]).map(Some);
        }
    }
    debug!(
        "[{port}] read-back ended with {} bytes, no full header",
        assembled.len()
    );
    Ok(None)
}

/// Slot-by-slot comparison of two track tables.
///
/// Covers every slot up to the highest occupied one on either side, never
/// beyond [`MAX_TRACKS`]; with no occupied slots it walks the first
/// [`COMPARE_DEFAULT_SPAN`] anyway. A slot empty on both sides matches;
/// differing id or size fails.
pub fn compare_tracks(
    local: &TrackTable,
    device: &TrackTable,
    reporter: &Reporter,
    port: &str,
    mac: &str,
) -> bool {
    let mut last_valid = COMPARE_DEFAULT_SPAN;
    for slot in 1..=MAX_TRACKS as u8 {
        if !local.slot(slot).is_empty() || !device.slot(slot).is_empty() {
            last_valid = slot;
        }
    }

    let mut all_match = true;
    for slot in 1..=last_valid {
        let l = local.slot(slot);
        let d = device.slot(slot);
        if l.is_empty() && d.is_empty() {
            continue;
        }
        if l.id != d.id {
            reporter.log(
                port,
                mac,
                format!("slot {slot}: id mismatch (local {} vs device {})", l.id, d.id),
            );
            all_match = false;
        } else if l.size != d.size {
            reporter.log(
                port,
                mac,
                format!(
                    "slot {slot}: size mismatch (local {} vs device {})",
                    l.size, d.size
                ),
            );
            all_match = false;
        } else {
            // front-end parses this line: TRACK_DETAIL:<slot>:<id>:<size>
            reporter.log(port, mac, format!("TRACK_DETAIL:{slot}:{}:{}", d.id, d.size));
        }
    }

    if all_match {
        reporter.log(port, mac, "track tables match");
    } else {
        reporter.log(port, mac, "track tables differ");
    }
    all_match
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Reporter;
    use crate::image::test_fixtures::image_bytes;
    use crate::image::Track;
    use crate::transport::testing::MockLink;

    fn fast_timings() -> ReadTimings {
        ReadTimings {
            settle: Duration::from_millis(0),
            chunk_window: Duration::from_millis(20),
            total_deadline: Duration::from_millis(60),
            request_gap: Duration::from_millis(0),
            poll: Duration::from_millis(1),
        }
    }

    const TRACK_A: Track = Track {
        id: 0x1234_5678,
        offset: 0x600,
        size: 0x400,
    };

    /// Wrap header bytes into device read-back frames, `page` bytes per frame.
    fn script_header_frames(link: &mut MockLink, header: &[u8], page: usize) {
        for (i, window) in header.chunks(page).enumerate() {
            let mut payload = vec![OP_READ_DATA];
            payload.extend_from_slice(window);
            #[allow(clippy::cast_possible_truncation)]
            let framed = frame::build_frame(frame::TARGET_DEVICE, i as u16, &payload);
            link.read_script.push_back(framed);
        }
    }

    fn image_with(tracks: &[(u8, Track)]) -> AdsImage {
        AdsImage::from_bytes(image_bytes(tracks, 512)).unwrap()
    }

    #[test]
    fn test_read_device_header_reassembles_pages() {
        let image = image_with(&[(1, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");
        script_header_frames(&mut link, image.header(), READ_PAGE_LEN);

        let table = read_device_header(&mut link, &reporter, "COM3", "AA", &fast_timings())
            .unwrap()
            .expect("header should assemble");
        assert_eq!(table.slot(1), TRACK_A);
    }

    #[test]
    fn test_read_device_header_handles_split_frames() {
        let image = image_with(&[(1, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");
        // device answers in small uneven bursts
        script_header_frames(&mut link, image.header(), 100);

        let table = read_device_header(&mut link, &reporter, "COM3", "AA", &fast_timings())
            .unwrap()
            .expect("header should assemble");
        assert_eq!(table.slot(1), TRACK_A);
    }

    #[test]
    fn test_read_device_header_gives_none_on_silence() {
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");
        let got = read_device_header(&mut link, &reporter, "COM3", "AA", &fast_timings()).unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn test_verify_match() {
        let image = image_with(&[(1, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");
        script_header_frames(&mut link, image.header(), READ_PAGE_LEN);

        let outcome =
            verify_device(&mut link, &image, &reporter, "COM3", "AA", &fast_timings()).unwrap();
        assert_eq!(outcome, VerifyOutcome::Match);
    }

    #[test]
    fn test_verify_mismatch_on_different_track() {
        let image = image_with(&[(1, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");

        let device_image = image_with(&[(
            1,
            Track {
                id: 0x99,
                offset: 0x600,
                size: 0x400,
            },
        )]);
        script_header_frames(&mut link, device_image.header(), READ_PAGE_LEN);

        let outcome =
            verify_device(&mut link, &image, &reporter, "COM3", "AA", &fast_timings()).unwrap();
        assert_eq!(outcome, VerifyOutcome::Mismatch);
    }

    #[test]
    fn test_verify_read_failure_is_an_error() {
        let image = image_with(&[(1, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();
        let mut link = MockLink::new("COM3");
        // unlock acks, but the device never answers reads

        let err = verify_device(&mut link, &image, &reporter, "COM3", "AA", &fast_timings())
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[test]
    fn test_compare_empty_tables_trivially_match() {
        let (reporter, _rx) = Reporter::channel();
        assert!(compare_tracks(
            &TrackTable::new(),
            &TrackTable::new(),
            &reporter,
            "COM3",
            "AA"
        ));
    }

    #[test]
    fn test_compare_size_mismatch_fails() {
        let (reporter, _rx) = Reporter::channel();
        let mut local = TrackTable::new();
        local.insert(1, TRACK_A);
        let mut device = TrackTable::new();
        device.insert(
            1,
            Track {
                size: 0x401,
                ..TRACK_A
            },
        );
        assert!(!compare_tracks(&local, &device, &reporter, "COM3", "AA"));
    }

    #[test]
    fn test_compare_extra_device_track_fails() {
        let (reporter, _rx) = Reporter::channel();
        let local = TrackTable::new();
        let mut device = TrackTable::new();
        device.insert(7, TRACK_A);
        assert!(!compare_tracks(&local, &device, &reporter, "COM3", "AA"));
    }

    #[test]
    fn test_repeated_reads_agree() {
        let image = image_with(&[(1, TRACK_A), (3, TRACK_A)]);
        let (reporter, _rx) = Reporter::channel();

        let mut first = MockLink::new("COM3");
        script_header_frames(&mut first, image.header(), READ_PAGE_LEN);
        let a = read_device_header(&mut first, &reporter, "COM3", "AA", &fast_timings())
            .unwrap()
            .unwrap();

        let mut second = MockLink::new("COM3");
        script_header_frames(&mut second, image.header(), READ_PAGE_LEN);
        let b = read_device_header(&mut second, &reporter, "COM3", "AA", &fast_timings())
            .unwrap()
            .unwrap();

        assert_eq!(a, b);
    }
}
