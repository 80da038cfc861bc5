//! Outer envelope of every message exchanged with the plug.
//!
//! ```text
//! ┌──────┬────────┬──────────────────────┬──────────┬────────────┐
//! │ 0x0F │ length │ payload (length - 1) │ checksum │ [0xFF 0xFF]│
//! └──────┴────────┴──────────────────────┴──────────┴────────────┘
//! ```
//!
//! `length` counts the payload plus the checksum byte. The checksum is
//! `(1 + sum(payload)) mod 256`. The terminator is always written by the
//! encoder but is optional on received frames; measurement replies never
//! carry it.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// First byte of every frame
pub const FRAME_HEADER: u8 = 0x0F;

/// Trailing bytes closing a frame
pub const FRAME_TERMINATOR: [u8; 2] = [0xFF, 0xFF];

/// Largest payload whose length still fits into the length byte
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize - 1;

/// Compute the frame checksum of a payload
#[must_use]
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(1u8, |acc, b| acc.wrapping_add(*b))
}

/// Wrap a payload into a complete, terminated frame
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLong`] if the payload exceeds [`MAX_PAYLOAD_SIZE`].
pub fn wrap(payload: &[u8]) -> Result<Bytes, FrameError> {
    let length = u8::try_from(payload.len() + 1).map_err(|_| FrameError::PayloadTooLong {
        len: payload.len(),
        max: MAX_PAYLOAD_SIZE,
    })?;

    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(FRAME_HEADER);
    buf.put_u8(length);
    buf.extend_from_slice(payload);
    buf.put_u8(checksum(payload));
    buf.extend_from_slice(&FRAME_TERMINATOR);

    Ok(buf.freeze())
}

/// Validate a received frame and return its payload
///
/// # Errors
///
/// - [`FrameError::MalformedHeader`] if the header byte is wrong or the length byte is missing or zero
/// - [`FrameError::Truncated`] if fewer bytes arrived than the length byte declares
/// - [`FrameError::ChecksumMismatch`] if the checksum byte does not match the payload
/// - [`FrameError::InvalidSuffix`] if anything other than `FF FF` follows the checksum
pub fn unwrap(raw: &[u8]) -> Result<&[u8], FrameError> {
    let (&header, rest) = raw
        .split_first()
        .ok_or_else(|| FrameError::MalformedHeader("empty frame".to_string()))?;

    if header != FRAME_HEADER {
        return Err(FrameError::MalformedHeader(format!(
            "expected {FRAME_HEADER:#04X}, found {header:#04X}"
        )));
    }

    let (&length, body) = rest
        .split_first()
        .ok_or_else(|| FrameError::MalformedHeader("missing length byte".to_string()))?;
    let length = usize::from(length);

    if length == 0 {
        return Err(FrameError::MalformedHeader(
            "length byte must cover the checksum".to_string(),
        ));
    }

    if body.len() < length {
        return Err(FrameError::Truncated {
            declared: length,
            available: body.len(),
        });
    }

    let (payload, tail) = body.split_at(length - 1);
    let received = tail[0];
    let computed = checksum(payload);

    if received != computed {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }

    let suffix = &tail[1..];
    if !suffix.is_empty() && suffix != FRAME_TERMINATOR {
        return Err(FrameError::InvalidSuffix {
            suffix: suffix.to_vec(),
        });
    }

    Ok(payload)
}
