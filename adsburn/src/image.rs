//! ADS audio image format.
//!
//! An ADS file starts with a 606-byte header followed by the audio content:
//!
//! ```text
//! +--------------------+
//! |  Magic (2B) 27 9D  |
//! +--------------------+
//! |  TrackCount (1B)   |
//! +--------------------+
//! |  Reserved (1B)     |
//! +--------------------+
//! |  Track[0]  (12B)   |  id: u32 LE | offset: u32 LE | size: u32 LE
//! +--------------------+
//! |       ...          |  up to 50 records
//! +--------------------+
//! |  Checksum (2B)     |  bytes 604..606, computed by the device
//! +--------------------+
//! |  Audio content     |
//! +--------------------+
//! ```
//!
//! Two buffers are derived from the file once per run and shared read-only
//! by every worker: the untouched `raw` bytes (authoritative for the
//! checksum finalise step) and the transmit-`encoded` bytes, in which the
//! checksum slots carry the `0xFF 0xFF` placeholder and every odd content
//! byte is biased by `+0x80`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::error::{Error, Result};

/// Header magic bytes.
pub const HEADER_MAGIC: [u8; 2] = [0x27, 0x9D];

/// Total header length in bytes.
pub const HEADER_LEN: usize = 606;

/// File offset of the two device-computed checksum bytes.
pub const CHECKSUM_OFFSET: usize = 604;

/// File offset of the first track record.
pub const TRACK_TABLE_OFFSET: usize = 4;

/// Size of one track record.
pub const TRACK_RECORD_LEN: usize = 12;

/// Maximum number of track records the header can hold.
pub const MAX_TRACKS: usize = 50;

/// Bias added to odd-offset content bytes for transmission.
pub const CONTENT_BIAS: u8 = 0x80;

/// One audio asset inside the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Track {
    /// Asset identifier.
    pub id: u32,
    /// Byte offset of the asset within the image.
    pub offset: u32,
    /// Asset length in bytes.
    pub size: u32,
}

impl Track {
    /// An unoccupied slot: zero id and zero size.
    pub fn is_empty(&self) -> bool {
        self.id == 0 && self.size == 0
    }
}

/// The track table of a header, indexed by 1-based slot number.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackTable {
    slots: BTreeMap<u8, Track>,
}

impl TrackTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a track at the given 1-based slot.
    pub fn insert(&mut self, slot: u8, track: Track) {
        self.slots.insert(slot, track);
    }

    /// Fetch the track at a slot; absent slots read as empty.
    pub fn slot(&self, slot: u8) -> Track {
        self.slots.get(&slot).copied().unwrap_or_default()
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no records are stored.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Parse a header from `data`, which must begin with the magic bytes.
pub fn parse_header(data: &[u8]) -> Result<TrackTable> {
    if data.len() < HEADER_LEN {
        return Err(Error::InvalidImage(format!(
            "header needs {HEADER_LEN} bytes, got {}",
            data.len()
        )));
    }
    if data[..2] != HEADER_MAGIC {
        return Err(Error::InvalidImage("header magic mismatch".into()));
    }

    let track_count = usize::from(data[2]);
    let mut tracks = TrackTable::new();
    for i in 0..track_count.min(MAX_TRACKS) {
        let at = TRACK_TABLE_OFFSET + i * TRACK_RECORD_LEN;
        let track = Track {
            id: LittleEndian::read_u32(&data[at..at + 4]),
            offset: LittleEndian::read_u32(&data[at + 4..at + 8]),
            size: LittleEndian::read_u32(&data[at + 8..at + 12]),
        };
        #[allow(clippy::cast_possible_truncation)] // slots run 1..=50
        tracks.insert((i + 1) as u8, track);
    }
    debug!("parsed header: {} track(s)", tracks.len());
    Ok(tracks)
}

/// Produce the transmit encoding of the raw file bytes.
///
/// The checksum slots at 604/605 become the `0xFF` placeholder, the rest of
/// the header is copied through, and odd-offset content bytes get the
/// `+0x80` bias.
pub fn encode_content(raw: &[u8]) -> Vec<u8> {
    raw.iter()
        .enumerate()
        .map(|(i, b)| {
            if i == CHECKSUM_OFFSET || i == CHECKSUM_OFFSET + 1 {
                0xFF
            } else if i < HEADER_LEN || i % 2 == 0 {
                *b
            } else {
                b.wrapping_add(CONTENT_BIAS)
            }
        })
        .collect()
}

/// A loaded audio image, shared read-only by all workers.
#[derive(Debug, Clone)]
pub struct AdsImage {
    /// Untransformed file bytes.
    pub raw: Vec<u8>,
    /// Transmit-encoded bytes, same length as `raw`.
    pub encoded: Vec<u8>,
    /// Offset of the header magic within `raw`.
    pub header_at: usize,
    /// Track table parsed from the local header.
    pub tracks: TrackTable,
}

impl AdsImage {
    /// Load and validate an image file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("loading image {}", path.display());
        let raw = fs::read(path)?;
        Self::from_bytes(raw)
    }

    /// Build an image from in-memory file bytes.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self> {
        let header_at = raw
            .windows(HEADER_MAGIC.len())
            .position(|w| w == HEADER_MAGIC)
            .ok_or_else(|| Error::InvalidImage("header magic not found".into()))?;
        if raw.len() < header_at + HEADER_LEN {
            return Err(Error::InvalidImage(format!(
                "file truncated: {} bytes after magic, need {HEADER_LEN}",
                raw.len() - header_at
            )));
        }

        let tracks = parse_header(&raw[header_at..header_at + HEADER_LEN])?;
        let encoded = encode_content(&raw);
        info!(
            "image loaded: {} KiB, {} track(s)",
            raw.len() / 1024,
            tracks.len()
        );
        Ok(Self {
            raw,
            encoded,
            header_at,
            tracks,
        })
    }

    /// Length of the transmit payload in bytes.
    pub fn encoded_len(&self) -> usize {
        self.encoded.len()
    }

    /// The local header window, starting at the magic bytes.
    pub fn header(&self) -> &[u8] {
        &self.raw[self.header_at..self.header_at + HEADER_LEN]
    }

    /// The two real checksum bytes from the source file.
    pub fn checksum_bytes(&self) -> &[u8] {
        &self.raw[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2]
    }
}


#[cfg(test)]
mod tests {
    use super::test_fixtures::image_bytes;
    use super::*;

    const TRACK_A: Track = Track {
        id: 0x1234_5678,
        offset: 0x600,
        size: 0x400,
    };

    #[test]
    fn test_encode_places_checksum_placeholder() {
        let raw = image_bytes(&[], 128);
        let encoded = encode_content(&raw);
        assert_eq!(encoded[CHECKSUM_OFFSET], 0xFF);
        assert_eq!(encoded[CHECKSUM_OFFSET + 1], 0xFF);
    }

    #[test]
    fn test_encode_copies_header_and_even_content() {
        let raw = image_bytes(&[(1, TRACK_A)], 64);
        let encoded = encode_content(&raw);
        for i in 0..HEADER_LEN {
            if i == CHECKSUM_OFFSET || i == CHECKSUM_OFFSET + 1 {
                continue;
            }
            assert_eq!(encoded[i], raw[i], "header byte {i}");
        }
        for i in (HEADER_LEN..raw.len()).filter(|i| i % 2 == 0) {
            assert_eq!(encoded[i], raw[i], "even content byte {i}");
        }
    }

    #[test]
    fn test_encode_biases_odd_content() {
        let raw = image_bytes(&[], 64);
        let encoded = encode_content(&raw);
        for i in (HEADER_LEN..raw.len()).filter(|i| i % 2 == 1) {
            assert_eq!(encoded[i], raw[i].wrapping_add(0x80), "odd content byte {i}");
        }
    }

    #[test]
    fn test_encode_bias_wraps() {
        let mut raw = image_bytes(&[], 2);
        raw[HEADER_LEN + 1] = 0x90;
        let encoded = encode_content(&raw);
        assert_eq!(encoded[HEADER_LEN + 1], 0x10);
    }

    #[test]
    fn test_parse_header_roundtrip() {
        let second = Track {
            id: 9,
            offset: 0xA00,
            size: 0x123,
        };
        let raw = image_bytes(&[(1, TRACK_A), (2, second)], 0);
        let tracks = parse_header(&raw).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks.slot(1), TRACK_A);
        assert_eq!(tracks.slot(2), second);
        assert!(tracks.slot(3).is_empty());
    }

    #[test]
    fn test_parse_header_caps_track_count() {
        let mut raw = image_bytes(&[(1, TRACK_A)], 0);
        raw[2] = 0xFF; // claims more tracks than the table can hold
        let tracks = parse_header(&raw).unwrap();
        assert_eq!(tracks.len(), MAX_TRACKS);
    }

    #[test]
    fn test_parse_header_rejects_short_or_unmagical_input() {
        assert!(parse_header(&[0u8; 100]).is_err());
        let mut raw = image_bytes(&[], 0);
        raw[0] = 0x00;
        assert!(parse_header(&raw).is_err());
    }

    #[test]
    fn test_image_from_bytes_happy_path() {
        let raw = image_bytes(&[(1, TRACK_A)], 2048 - HEADER_LEN);
        let image = AdsImage::from_bytes(raw.clone()).unwrap();
        assert_eq!(image.encoded_len(), 2048);
        assert_eq!(image.header_at, 0);
        assert_eq!(image.tracks.slot(1), TRACK_A);
        assert_eq!(image.checksum_bytes(), &raw[604..606]);
        assert_eq!(image.header(), &raw[..HEADER_LEN]);
    }

    #[test]
    fn test_image_zero_tracks_is_valid() {
        let image = AdsImage::from_bytes(image_bytes(&[], 0)).unwrap();
        assert!(image.tracks.is_empty());
    }

    #[test]
    fn test_image_rejects_missing_magic() {
        assert!(matches!(
            AdsImage::from_bytes(vec![0u8; 4096]),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_image_rejects_short_file() {
        let mut raw = vec![0u8; 100];
        raw[..2].copy_from_slice(&HEADER_MAGIC);
        assert!(matches!(
            AdsImage::from_bytes(raw),
            Err(Error::InvalidImage(_))
        ));
    }
}
