//! Encoded polyline codec.
//!
//! Routes come back from the directions service as an encoded polyline: each
//! coordinate is stored as the delta from the previous one, multiplied by
//! 1e5, zig-zag encoded, and split into 5-bit little-endian chunks. Each
//! chunk is written as one ASCII character (`chunk + 63`), with bit `0x20`
//! set on every chunk except the last of a value.
//!
//! Decoding is strict: anything that is not a complete sequence of
//! (latitude, longitude) pairs is rejected with the offending byte offset.

use thiserror::Error;

use crate::types::GeoPoint;

/// Coordinate scale used by the format.
const PRECISION: f64 = 1e5;

/// Added to every chunk to land in printable ASCII.
const CHAR_OFFSET: u8 = 63;

/// Continuation bit.
const CONTINUATION: u32 = 0x20;

/// Payload bits per chunk.
const CHUNK_MASK: u32 = 0x1f;

/// A 32-bit value never needs more than 7 chunks.
const MAX_SHIFT: u32 = 30;

/// Errors produced while encoding or decoding a polyline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolylineError {
    /// A byte outside `'?'..='~'` was found.
    #[error("invalid polyline character {byte:#04x} at offset {offset}")]
    InvalidCharacter {
        /// Byte offset into the input.
        offset: usize,
        /// The offending byte.
        byte: u8,
    },

    /// The input ended in the middle of a value.
    #[error("polyline truncated at offset {offset}: value is missing its final chunk")]
    Truncated {
        /// Offset where the incomplete value started.
        offset: usize,
    },

    /// A latitude was decoded with no longitude following it.
    #[error("polyline ends with an unpaired latitude at offset {offset}")]
    UnpairedLatitude {
        /// Offset where the unpaired latitude started.
        offset: usize,
    },

    /// A value kept its continuation bit set past 32 bits.
    #[error("polyline value starting at offset {offset} overflows 32 bits")]
    Overflow {
        /// Offset where the oversized value started.
        offset: usize,
    },

    /// A point to encode is not a finite latitude/longitude pair.
    #[error("point {index} is not a valid coordinate")]
    InvalidPoint {
        /// Position of the point in the input.
        index: usize,
    },
}

/// Result alias for polyline operations.
pub type PolylineResult<T> = std::result::Result<T, PolylineError>;

/// Decode an encoded polyline into an ordered list of points.
///
/// `decode("")` returns an empty list.
///
/// # Errors
///
/// Returns a [`PolylineError`] if the input is not a whole number of
/// well-formed (latitude, longitude) pairs.
pub fn decode(encoded: &str) -> PolylineResult<Vec<GeoPoint>> {
    let bytes = encoded.as_bytes();
    let mut points = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;

    while index < bytes.len() {
        let lat_start = index;
        lat += next_delta(bytes, &mut index)?;

        if index >= bytes.len() {
            return Err(PolylineError::UnpairedLatitude { offset: lat_start });
        }
        lng += next_delta(bytes, &mut index)?;

        points.push(GeoPoint::new(unscale(lat), unscale(lng)));
    }

    Ok(points)
}

/// Encode points as a polyline, rounding each coordinate to 1e-5.
///
/// # Errors
///
/// Returns [`PolylineError::InvalidPoint`] for a NaN or infinite coordinate,
/// a latitude outside ±90 or a longitude outside ±180.
pub fn encode(points: &[GeoPoint]) -> PolylineResult<String> {
    let mut out = String::with_capacity(points.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for (index, point) in points.iter().enumerate() {
        if !in_range(point) {
            return Err(PolylineError::InvalidPoint { index });
        }
        let lat = scale(point.latitude);
        let lng = scale(point.longitude);
        push_value(&mut out, lat - prev_lat);
        push_value(&mut out, lng - prev_lng);
        prev_lat = lat;
        prev_lng = lng;
    }

    Ok(out)
}

/// Range checks also reject NaN and infinities.
fn in_range(point: &GeoPoint) -> bool {
    (-90.0..=90.0).contains(&point.latitude) && (-180.0..=180.0).contains(&point.longitude)
}

/// Read one zig-zag encoded delta starting at `*index`.
fn next_delta(bytes: &[u8], index: &mut usize) -> PolylineResult<i64> {
    let start = *index;
    let mut result: u32 = 0;
    let mut shift: u32 = 0;

    loop {
        let Some(&byte) = bytes.get(*index) else {
            return Err(PolylineError::Truncated { offset: start });
        };
        if !(CHAR_OFFSET..=b'~').contains(&byte) {
            return Err(PolylineError::InvalidCharacter {
                offset: *index,
                byte,
            });
        }
        if shift > MAX_SHIFT {
            return Err(PolylineError::Overflow { offset: start });
        }
        *index += 1;

        let chunk = u32::from(byte - CHAR_OFFSET);
        result |= (chunk & CHUNK_MASK) << shift;
        shift += 5;

        if chunk < CONTINUATION {
            break;
        }
    }

    let value = i64::from(result >> 1);
    Ok(if result & 1 == 1 { !value } else { value })
}

#[allow(clippy::cast_precision_loss)]
fn unscale(total: i64) -> f64 {
    total as f64 / PRECISION
}

#[allow(clippy::cast_possible_truncation)]
fn scale(coordinate: f64) -> i64 {
    (coordinate * PRECISION).round() as i64
}

fn push_value(out: &mut String, delta: i64) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };
    while value >= i64::from(CONTINUATION) {
        let chunk = (value & i64::from(CHUNK_MASK)) | i64::from(CONTINUATION);
        out.push(to_char(chunk));
        value >>= 5;
    }
    out.push(to_char(value));
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_char(chunk: i64) -> char {
    char::from(chunk as u8 + CHAR_OFFSET)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn assert_close(actual: &GeoPoint, lat: f64, lng: f64) {
        assert!((actual.latitude - lat).abs() < 1e-9, "lat {actual:?}");
        assert!((actual.longitude - lng).abs() < 1e-9, "lng {actual:?}");
    }

    #[test]
    fn test_decode_empty() {
        assert_eq!(decode("").unwrap(), Vec::new());
    }

    #[test]
    fn test_decode_reference_sample() {
        let points = decode(SAMPLE).unwrap();
        assert_eq!(points.len(), 3);
        assert_close(&points[0], 38.5, -120.2);
        assert_close(&points[1], 40.7, -120.95);
        assert_close(&points[2], 43.252, -126.453);
    }

    #[test]
    fn test_encode_reference_sample() {
        let points = [
            GeoPoint::new(38.5, -120.2),
            GeoPoint::new(40.7, -120.95),
            GeoPoint::new(43.252, -126.453),
        ];
        assert_eq!(encode(&points).unwrap(), SAMPLE);
    }

    #[test]
    fn test_round_trip_at_five_decimals() {
        let points = vec![
            GeoPoint::new(46.78601, -121.73551),
            GeoPoint::new(46.78599, -121.73560),
            GeoPoint::new(-33.86785, 151.20732),
            GeoPoint::new(0.0, 0.0),
            GeoPoint::new(89.99999, -179.99999),
        ];
        let decoded = decode(&encode(&points).unwrap()).unwrap();
        assert_eq!(decoded.len(), points.len());
        for (got, want) in decoded.iter().zip(&points) {
            assert_close(got, want.latitude, want.longitude);
        }
    }

    #[test]
    fn test_decode_is_stateless_across_calls() {
        let first = decode(SAMPLE).unwrap();
        let second = decode(SAMPLE).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_chunk_is_rejected() {
        // Drop the final character so the last longitude never terminates.
        let truncated = &SAMPLE[..SAMPLE.len() - 1];
        assert!(matches!(
            decode(truncated),
            Err(PolylineError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unpaired_latitude_is_rejected() {
        // "_p~iF" is exactly one complete latitude.
        assert_eq!(
            decode("_p~iF"),
            Err(PolylineError::UnpairedLatitude { offset: 0 })
        );
    }

    #[test]
    fn test_invalid_character_is_rejected() {
        assert_eq!(
            decode("_p~iF ps|U"),
            Err(PolylineError::InvalidCharacter {
                offset: 5,
                byte: b' '
            })
        );
    }

    #[test]
    fn test_runaway_continuation_overflows() {
        let runaway = "~".repeat(12);
        assert_eq!(decode(&runaway), Err(PolylineError::Overflow { offset: 0 }));
    }

    #[test]
    fn test_encode_rejects_unusable_points() {
        let infinite = [GeoPoint::new(10.0, 20.0), GeoPoint::new(f64::INFINITY, 0.0)];
        assert_eq!(encode(&infinite), Err(PolylineError::InvalidPoint { index: 1 }));

        let nan = [GeoPoint::new(0.0, f64::NAN)];
        assert_eq!(encode(&nan), Err(PolylineError::InvalidPoint { index: 0 }));

        let off_globe = [GeoPoint::new(1e300, -1e300)];
        assert!(encode(&off_globe).is_err());
    }

    #[test]
    fn test_encode_handles_extreme_jumps() {
        let points = [GeoPoint::new(-90.0, -180.0), GeoPoint::new(90.0, 180.0)];
        let decoded = decode(&encode(&points).unwrap()).unwrap();
        assert_close(&decoded[1], 90.0, 180.0);
    }
}
