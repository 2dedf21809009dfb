//! Fixed 8-byte command/reply frame.
//!
//! ```text
//! [0] 0xFE start
//! [1] opcode
//! [2] device id
//! [3] content high
//! [4] content low
//! [5] checksum high   (CRC over bytes 0..=4)
//! [6] checksum low
//! [7] 0xFF end
//! ```

use crate::crc::checksum;
use thiserror::Error;

/// Start-of-frame marker.
pub const START: u8 = 0xFE;
/// End-of-frame marker.
pub const END: u8 = 0xFF;
/// Every frame on the link is exactly this long.
pub const FRAME_LEN: usize = 8;

/// Reasons a candidate byte sequence is not a valid frame.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Wrong number of bytes.
    #[error("frame must be {FRAME_LEN} bytes, got {0}")]
    BadLength(usize),

    /// First or last byte is not a marker.
    #[error("bad frame markers: start {start:#04x}, end {end:#04x}")]
    BadMarker {
        /// Byte found at the start.
        start: u8,
        /// Byte found at the end.
        end: u8,
    },

    /// CRC bytes disagree with the header.
    #[error("checksum mismatch: expected {expected:02X?}, found {found:02X?}")]
    ChecksumMismatch {
        /// CRC computed over the header.
        expected: [u8; 2],
        /// CRC carried by the frame.
        found: [u8; 2],
    },
}

/// One encoded frame. Always holds valid markers and checksum.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Frame([u8; FRAME_LEN]);

impl Frame {
    /// Build a frame from its four payload fields.
    pub fn encode(opcode: u8, device_id: u8, content_high: u8, content_low: u8) -> Self {
        let header = [START, opcode, device_id, content_high, content_low];
        let [crc_hi, crc_lo] = checksum(&header);
        Self([
            START,
            opcode,
            device_id,
            content_high,
            content_low,
            crc_hi,
            crc_lo,
            END,
        ])
    }

    /// Build a frame carrying a 16-bit big-endian content value.
    pub fn with_content(opcode: u8, device_id: u8, content: u16) -> Self {
        let [hi, lo] = content.to_be_bytes();
        Self::encode(opcode, device_id, hi, lo)
    }

    /// Validate raw bytes received from the link.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        let raw: [u8; FRAME_LEN] = bytes
            .try_into()
            .map_err(|_| FrameError::BadLength(bytes.len()))?;

        if raw[0] != START || raw[7] != END {
            return Err(FrameError::BadMarker {
                start: raw[0],
                end: raw[7],
            });
        }

        let expected = checksum(&raw[..5]);
        let found = [raw[5], raw[6]];
        if expected != found {
            return Err(FrameError::ChecksumMismatch { expected, found });
        }

        Ok(Self(raw))
    }

    /// Command or reply code.
    pub fn opcode(&self) -> u8 {
        self.0[1]
    }

    /// Device byte; a pump or board id for pipette commands.
    pub fn device_id(&self) -> u8 {
        self.0[2]
    }

    /// First content byte.
    pub fn content_high(&self) -> u8 {
        self.0[3]
    }

    /// Second content byte.
    pub fn content_low(&self) -> u8 {
        self.0[4]
    }

    /// Content bytes as a big-endian value.
    pub fn content(&self) -> u16 {
        u16::from_be_bytes([self.0[3], self.0[4]])
    }

    /// CRC bytes as carried on the wire.
    pub fn checksum(&self) -> [u8; 2] {
        [self.0[5], self.0[6]]
    }

    /// The raw frame.
    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Frame({:02X?})", self.0)
    }
}
