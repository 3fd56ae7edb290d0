//! Heart rate frame decoding.
//!
//! The sensor notifies a two-byte little-endian `u16`. Characteristic values
//! cross the transport boundary as base64 text, the representation mobile
//! BLE stacks hand out, so every backend produces the same [`Frame`].

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use thiserror::Error;

/// One notification from the heart rate characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Base64 characteristic value, absent when the stack delivered none.
    pub value: Option<String>,
}

impl Frame {
    /// Wrap an already-encoded value.
    #[must_use]
    pub fn from_base64(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
        }
    }

    /// Wrap raw notification bytes.
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self::from_base64(STANDARD.encode(bytes))
    }

    /// A notification with no payload.
    #[must_use]
    pub const fn empty() -> Self {
        Self { value: None }
    }

    /// Encode a heart rate value the way the sensor does.
    #[must_use]
    pub fn heart_rate(bpm: u16) -> Self {
        Self::from_bytes(&bpm.to_le_bytes())
    }
}

/// Why a frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The notification carried no value.
    #[error("frame has no payload")]
    Missing,

    /// The value was not valid base64.
    #[error("frame payload is not valid base64: {0}")]
    InvalidBase64(String),

    /// Fewer than two bytes decoded.
    #[error("frame payload too short: expected 2 bytes, got {0}")]
    TooShort(usize),
}

/// Decode a frame into a heart rate value.
///
/// The low byte comes first. Bytes past the second are ignored.
///
/// # Errors
///
/// Returns a [`FrameError`] if the payload is absent, not base64, or shorter
/// than two bytes.
pub fn decode_frame(frame: &Frame) -> Result<u16, FrameError> {
    let text = frame.value.as_deref().ok_or(FrameError::Missing)?;
    let bytes = STANDARD
        .decode(text.trim())
        .map_err(|e| FrameError::InvalidBase64(e.to_string()))?;

    match bytes.as_slice() {
        [low, high, ..] => Ok(u16::from_le_bytes([*low, *high])),
        short => Err(FrameError::TooShort(short.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_little_endian() {
        // 0xD2 0x00 -> 210
        assert_eq!(decode_frame(&Frame::from_base64("0gA=")), Ok(210));
        // 0x2C 0x01 -> 300, high byte matters
        assert_eq!(decode_frame(&Frame::from_bytes(&[0x2c, 0x01])), Ok(300));
    }

    #[test]
    fn test_heart_rate_helper_round_trips() {
        for bpm in [0_u16, 39, 72, 201, u16::MAX] {
            assert_eq!(decode_frame(&Frame::heart_rate(bpm)), Ok(bpm));
        }
    }

    #[test]
    fn test_extra_bytes_are_ignored() {
        assert_eq!(decode_frame(&Frame::from_bytes(&[60, 0, 0xff, 0xff])), Ok(60));
    }

    #[test]
    fn test_missing_payload() {
        assert_eq!(decode_frame(&Frame::empty()), Err(FrameError::Missing));
    }

    #[test]
    fn test_short_payload() {
        assert_eq!(
            decode_frame(&Frame::from_bytes(&[72])),
            Err(FrameError::TooShort(1))
        );
        assert_eq!(decode_frame(&Frame::from_base64("")), Err(FrameError::TooShort(0)));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(matches!(
            decode_frame(&Frame::from_base64("not base64!")),
            Err(FrameError::InvalidBase64(_))
        ));
    }
}
