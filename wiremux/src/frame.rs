//! Wire framing for envelope payloads.
//!
//! Frame format: `[length:4][checksum:4][payload:N]`
//!
//! - **length**: Total frame size including header (little-endian u32)
//! - **checksum**: CRC32C of the payload
//! - **payload**: One codec-encoded envelope
//!
//! The framing carries no protocol knowledge of its own; everything the
//! multiplexer cares about lives inside the payload.

use thiserror::Error;

/// Header size: 4 (length) + 4 (checksum) = 8 bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Maximum payload size (1MB).
///
/// Frames larger than this are rejected to bound memory per connection.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Framing error types.
#[derive(Debug, Clone, Error)]
pub enum FrameError {
    /// Checksum verification failed.
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    ChecksumMismatch {
        /// Expected checksum from the header.
        expected: u32,
        /// Computed checksum from the data.
        actual: u32,
    },

    /// Payload exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes (max {MAX_FRAME_PAYLOAD})")]
    FrameTooLarge {
        /// Actual payload size in bytes.
        size: usize,
    },

    /// Length field has an invalid value.
    #[error("invalid frame length: {length}")]
    InvalidLength {
        /// The invalid length value from the header.
        length: u32,
    },
}

/// Serialize a frame around the given payload.
///
/// # Errors
///
/// Returns `FrameTooLarge` if the payload exceeds [`MAX_FRAME_PAYLOAD`].
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::FrameTooLarge {
            size: payload.len(),
        });
    }

    let total = FRAME_HEADER_SIZE + payload.len();
    let mut data = Vec::with_capacity(total);
    data.extend_from_slice(&(total as u32).to_le_bytes());
    data.extend_from_slice(&crc32c::crc32c(payload).to_le_bytes());
    data.extend_from_slice(payload);
    Ok(data)
}

/// Try to parse one frame from a buffer that may hold partial data.
///
/// Intended for streaming reads where frames arrive incrementally.
///
/// # Returns
///
/// - `Ok(Some((payload, consumed)))` if a complete frame was parsed
/// - `Ok(None)` if more data is needed (not an error condition)
/// - `Err` if the data is malformed; the connection should be torn down
pub fn try_decode_frame(data: &[u8]) -> Result<Option<(Vec<u8>, usize)>, FrameError> {
    if data.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }

    let length = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let checksum = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);

    if (length as usize) < FRAME_HEADER_SIZE {
        return Err(FrameError::InvalidLength { length });
    }
    if length as usize - FRAME_HEADER_SIZE > MAX_FRAME_PAYLOAD {
        return Err(FrameError::FrameTooLarge {
            size: length as usize - FRAME_HEADER_SIZE,
        });
    }

    let expected_len = length as usize;
    if data.len() < expected_len {
        return Ok(None);
    }

    let payload = &data[FRAME_HEADER_SIZE..expected_len];
    let computed = crc32c::crc32c(payload);
    if computed != checksum {
        return Err(FrameError::ChecksumMismatch {
            expected: checksum,
            actual: computed,
        });
    }

    Ok(Some((payload.to_vec(), expected_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = encode_frame(b"hello world").expect("encode");
        let (payload, consumed) = try_decode_frame(&frame)
            .expect("decode")
            .expect("complete frame");

        assert_eq!(payload, b"hello world");
        assert_eq!(consumed, frame.len());
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode_frame(&[]).expect("encode");
        assert_eq!(frame.len(), FRAME_HEADER_SIZE);

        let (payload, consumed) = try_decode_frame(&frame)
            .expect("decode")
            .expect("complete frame");
        assert!(payload.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_partial_header_needs_more_data() {
        let frame = encode_frame(b"data").expect("encode");
        assert!(try_decode_frame(&frame[..5]).expect("partial").is_none());
    }

    #[test]
    fn test_partial_payload_needs_more_data() {
        let frame = encode_frame(b"data that is long enough").expect("encode");
        let partial = &frame[..FRAME_HEADER_SIZE + 3];
        assert!(try_decode_frame(partial).expect("partial").is_none());
    }

    #[test]
    fn test_checksum_mismatch_on_corruption() {
        let mut frame = encode_frame(b"data").expect("encode");
        frame[FRAME_HEADER_SIZE] ^= 0xFF;

        let result = try_decode_frame(&frame);
        assert!(matches!(result, Err(FrameError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_trailing_bytes_left_in_buffer() {
        let mut buf = encode_frame(b"first").expect("encode");
        let first_len = buf.len();
        buf.extend_from_slice(&encode_frame(b"second").expect("encode"));

        let (payload, consumed) = try_decode_frame(&buf)
            .expect("decode")
            .expect("complete frame");
        assert_eq!(payload, b"first");
        assert_eq!(consumed, first_len);

        let (payload, _) = try_decode_frame(&buf[consumed..])
            .expect("decode")
            .expect("complete frame");
        assert_eq!(payload, b"second");
    }

    #[test]
    fn test_invalid_length_rejected() {
        let mut frame = encode_frame(b"data").expect("encode");
        frame[0..4].copy_from_slice(&3u32.to_le_bytes());

        let result = try_decode_frame(&frame);
        assert!(matches!(
            result,
            Err(FrameError::InvalidLength { length: 3 })
        ));
    }

    #[test]
    fn test_frame_too_large_rejected() {
        let oversized = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        assert!(matches!(
            encode_frame(&oversized),
            Err(FrameError::FrameTooLarge { .. })
        ));
    }
}
