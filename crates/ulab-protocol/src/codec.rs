//! Streaming frame decoder with resync-on-corruption.
//!
//! Bytes arrive in arbitrary chunks. The decoder looks for any offset `i`
//! with `buf[i] == START` and `buf[i + 7] == END`, lifts those eight bytes out
//! of the buffer and validates the checksum. A candidate that fails validation
//! is dropped and the scan resumes at the same offset, so a single corrupted
//! frame never stalls the stream. Partial frames stay buffered until more
//! bytes arrive.

use crate::frame::{Frame, END, FRAME_LEN, START};
use bytes::{Buf, BytesMut};

/// Result of one [`scan`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scan {
    /// First valid frame found, if any.
    pub frame: Option<Frame>,
    /// Bytes removed from the buffer (valid frame plus rejected candidates).
    pub consumed: usize,
    /// Candidates that had markers in place but failed validation.
    pub rejected: usize,
}

/// Remove the first valid frame from `buffer`.
///
/// Never blocks and never consumes a trailing partial frame.
pub fn scan(buffer: &mut BytesMut) -> Scan {
    let mut consumed = 0;
    let mut rejected = 0;
    let mut index = 0;

    while index + FRAME_LEN <= buffer.len() {
        if buffer[index] != START || buffer[index + FRAME_LEN - 1] != END {
            index += 1;
            continue;
        }

        let mut candidate = [0u8; FRAME_LEN];
        candidate.copy_from_slice(&buffer[index..index + FRAME_LEN]);
        remove_at(buffer, index);
        consumed += FRAME_LEN;

        match Frame::from_bytes(&candidate) {
            Ok(frame) => {
                return Scan {
                    frame: Some(frame),
                    consumed,
                    rejected,
                }
            }
            Err(e) => {
                rejected += 1;
                tracing::trace!(offset = index, error = %e, "dropping corrupted frame");
            }
        }
    }

    Scan {
        frame: None,
        consumed,
        rejected,
    }
}

fn remove_at(buffer: &mut BytesMut, index: usize) {
    if index == 0 {
        buffer.advance(FRAME_LEN);
    } else {
        let tail = buffer.split_off(index + FRAME_LEN);
        buffer.truncate(index);
        buffer.unsplit(tail);
    }
}

/// Receive-side decoder owning the accumulation buffer.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
    rejected: u64,
}

impl FrameCodec {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next valid frame, if a complete one is buffered.
    pub fn next_frame(&mut self) -> Option<Frame> {
        let scan = scan(&mut self.buffer);
        self.rejected += scan.rejected as u64;
        scan.frame
    }

    /// Decode every complete frame currently buffered.
    ///
    /// Afterwards only the last `FRAME_LEN - 1` bytes are kept: anything
    /// earlier already has its would-be end marker in the buffer and can no
    /// longer start a frame.
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame() {
            frames.push(frame);
        }
        let keep = FRAME_LEN - 1;
        if self.buffer.len() > keep {
            let stale = self.buffer.len() - keep;
            self.buffer.advance(stale);
        }
        frames
    }

    /// Bytes waiting for the rest of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total candidates dropped for bad checksums.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Forget buffered bytes, for example after reopening the port.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(parts: &[&[u8]]) -> BytesMut {
        let mut b = BytesMut::new();
        for p in parts {
            b.extend_from_slice(p);
        }
        b
    }

    #[test]
    fn test_scan_roundtrip_fields() {
        let frame = Frame::encode(0x0A, 0x01, 0x00, 0x01);
        let mut buffer = buf(&[frame.as_ref()]);
        let result = scan(&mut buffer);
        let decoded = result.frame.unwrap();
        assert_eq!(
            (
                decoded.opcode(),
                decoded.device_id(),
                decoded.content_high(),
                decoded.content_low()
            ),
            (0x0A, 0x01, 0x00, 0x01)
        );
        assert_eq!(result.consumed, FRAME_LEN);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_corrupted_then_valid_yields_one() {
        let mut bad = *Frame::encode(0x08, 0x02, 0x11, 0x94).as_bytes();
        bad[5] ^= 0xFF;
        let good = Frame::encode(0x24, 0x04, 0x01, 0x2C);

        let mut codec = FrameCodec::new();
        codec.extend(&bad);
        codec.extend(good.as_ref());

        let frames = codec.drain_frames();
        assert_eq!(frames, vec![good]);
        assert_eq!(codec.rejected(), 1);
    }

    #[test]
    fn test_truncated_buffer_consumes_nothing() {
        let frame = Frame::encode(0x02, 0x02, 0x00, 0x10);
        let mut buffer = buf(&[&frame.as_ref()[..5]]);
        let result = scan(&mut buffer);
        assert_eq!(result.frame, None);
        assert_eq!(result.consumed, 0);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_frame_split_across_reads() {
        let frame = Frame::encode(0x08, 0x03, 0x01, 0xF4);
        let mut codec = FrameCodec::new();
        codec.extend(&frame.as_ref()[..3]);
        assert!(codec.drain_frames().is_empty());
        codec.extend(&frame.as_ref()[3..]);
        assert_eq!(codec.drain_frames(), vec![frame]);
        assert_eq!(codec.buffered(), 0);
    }

    #[test]
    fn test_garbage_between_frames_is_skipped() {
        let a = Frame::encode(0x08, 0x02, 0x00, 0x01);
        let b = Frame::encode(0x10, 0x02, 0x00, 0x02);
        let mut codec = FrameCodec::new();
        codec.extend(&[0x00, 0x13, 0xFE]);
        codec.extend(a.as_ref());
        codec.extend(&[0xFF, 0x42]);
        codec.extend(b.as_ref());
        assert_eq!(codec.drain_frames(), vec![a, b]);
        assert!(codec.buffered() < FRAME_LEN);
    }

    #[test]
    fn test_noise_does_not_accumulate() {
        let mut codec = FrameCodec::new();
        for _ in 0..100 {
            codec.extend(&[0x11; 64]);
            assert!(codec.drain_frames().is_empty());
        }
        assert!(codec.buffered() < FRAME_LEN);
    }
}
