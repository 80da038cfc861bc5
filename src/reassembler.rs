//! Collects notification fragments until they form one complete frame.

use bytes::{Bytes, BytesMut};

use crate::frame::{FRAME_HEADER, FRAME_TERMINATOR};

/// Payload prefix of measurement replies, which arrive without a terminator
const MEASUREMENT_PREFIX: [u8; 2] = [0x04, 0x00];

/// Fragment buffer for a single transaction
///
/// A reply is complete once the collected bytes cover the length announced
/// in the frame header and either end with the terminator or carry a
/// measurement payload.
#[derive(Debug, Default)]
pub struct Reassembler {
    buffer: BytesMut,
    fragments: usize,
}

impl Reassembler {
    /// Create an empty reassembler
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything collected so far
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.fragments = 0;
    }

    /// Append one fragment in arrival order
    pub fn push(&mut self, fragment: &[u8]) {
        self.buffer.extend_from_slice(fragment);
        self.fragments += 1;
    }

    /// Number of bytes collected
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether nothing has been collected
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of fragments collected
    #[must_use]
    pub const fn fragments(&self) -> usize {
        self.fragments
    }

    /// Whether the collected bytes form a complete reply
    #[must_use]
    pub fn is_complete(&self) -> bool {
        let raw = &self.buffer[..];
        let is_measurement = raw.get(2..4) == Some(&MEASUREMENT_PREFIX[..]);

        if raw.first() == Some(&FRAME_HEADER) {
            let Some(&length) = raw.get(1) else {
                return false;
            };
            let framed = 2 + usize::from(length);

            // Checksum and terminator may both be FF, so the terminator only
            // counts once it follows the checksum
            return if is_measurement {
                raw.len() >= framed
            } else {
                raw.len() >= framed + FRAME_TERMINATOR.len() && raw.ends_with(&FRAME_TERMINATOR)
            };
        }

        raw.ends_with(&FRAME_TERMINATOR) || is_measurement
    }

    /// Take the collected bytes, leaving the reassembler empty
    pub fn take(&mut self) -> Bytes {
        self.fragments = 0;
        self.buffer.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::wrap;

    #[test]
    fn test_single_fragment() {
        let frame = wrap(&[0x03, 0x00, 0x00]).unwrap();
        let mut reassembler = Reassembler::new();
        assert!(!reassembler.is_complete());

        reassembler.push(&frame);
        assert!(reassembler.is_complete());
        assert_eq!(reassembler.take(), frame);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_fragments_concatenate_in_order() {
        let payload: Vec<u8> = [0x0C, 0x00].into_iter().chain(0..44).collect();
        let frame = wrap(&payload).unwrap();

        let mut reassembler = Reassembler::new();
        for chunk in frame.chunks(20) {
            assert!(!reassembler.is_complete());
            reassembler.push(chunk);
        }

        assert!(reassembler.is_complete());
        assert_eq!(reassembler.fragments(), 3);
        assert_eq!(reassembler.take(), frame);
    }

    #[test]
    fn test_terminator_inside_payload_does_not_complete() {
        let frame = wrap(&[0x11, 0x00, 0xFF, 0xFF, 0x41, 0x42, 0xFF, 0xFF]).unwrap();
        let mut reassembler = Reassembler::new();

        reassembler.push(&frame[..6]);
        assert!(frame[..6].ends_with(&FRAME_TERMINATOR));
        assert!(!reassembler.is_complete());

        reassembler.push(&frame[6..]);
        assert!(reassembler.is_complete());
    }

    #[test]
    fn test_checksum_ff_split_before_last_terminator_byte() {
        // 03 00 FB sums to FE, so the checksum byte is FF
        let frame = wrap(&[0x03, 0x00, 0xFB]).unwrap();
        assert_eq!(&frame[..], &[0x0F, 0x04, 0x03, 0x00, 0xFB, 0xFF, 0xFF, 0xFF]);

        let mut reassembler = Reassembler::new();
        reassembler.push(&frame[..7]);
        assert!(!reassembler.is_complete());

        reassembler.push(&frame[7..]);
        assert!(reassembler.is_complete());
        assert_eq!(crate::frame::unwrap(&reassembler.take()).unwrap(), &[0x03, 0x00, 0xFB]);
    }

    #[test]
    fn test_measurement_completes_without_terminator() {
        let mut payload = vec![0x04, 0x00, 0x01];
        payload.extend_from_slice(&[0x00; 13]);
        let frame = wrap(&payload).unwrap();
        let unterminated = &frame[..frame.len() - 2];

        let mut reassembler = Reassembler::new();
        reassembler.push(&unterminated[..10]);
        assert!(!reassembler.is_complete());

        reassembler.push(&unterminated[10..]);
        assert!(reassembler.is_complete());
    }

    #[test]
    fn test_missing_terminator_is_incomplete() {
        let frame = wrap(&[0x03, 0x00, 0x00]).unwrap();
        let mut reassembler = Reassembler::new();
        reassembler.push(&frame[..frame.len() - 2]);
        assert!(!reassembler.is_complete());
    }

    #[test]
    fn test_reset_discards_partial_reply() {
        let mut reassembler = Reassembler::new();
        reassembler.push(&[0x0F, 0x10, 0x14]);
        reassembler.reset();

        assert!(reassembler.is_empty());
        assert_eq!(reassembler.fragments(), 0);
        assert!(!reassembler.is_complete());
    }
}
