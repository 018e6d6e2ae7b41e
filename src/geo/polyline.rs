//! Encoded polyline codec (5 decimal digits of precision).
//!
//! Each value is a zig-zag signed delta from the previous point, split into
//! 5-bit chunks, least significant first, with `0x20` marking that another
//! chunk follows, offset by 63 into printable ASCII.

use thiserror::Error;

use crate::models::location::Coordinate;

const PRECISION: f64 = 1e5;
const ASCII_OFFSET: u8 = 63;
const CONTINUATION: i64 = 0x20;
const CHUNK_MASK: i64 = 0x1f;
/// 7 chunks carry 35 bits, enough for any delta within +/-180 degrees.
const MAX_CHUNKS: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("invalid byte 0x{byte:02x} at offset {offset}")]
    InvalidByte { offset: usize, byte: u8 },

    #[error("value starting at offset {offset} never terminates")]
    Overlong { offset: usize },

    #[error("input truncated at offset {offset}")]
    Truncated { offset: usize },
}

pub fn decode(encoded: &str) -> Result<Vec<Coordinate>, DecodeError> {
    let bytes = encoded.as_bytes();
    let mut coordinates = Vec::new();
    let mut index = 0;
    let mut lat: i64 = 0;
    let mut lng: i64 = 0;

    while index < bytes.len() {
        lat += read_value(bytes, &mut index)?;
        lng += read_value(bytes, &mut index)?;
        coordinates.push(Coordinate::new(
            lat as f64 / PRECISION,
            lng as f64 / PRECISION,
        ));
    }

    Ok(coordinates)
}

pub fn encode(coordinates: &[Coordinate]) -> String {
    let mut encoded = String::with_capacity(coordinates.len() * 8);
    let mut prev_lat: i64 = 0;
    let mut prev_lng: i64 = 0;

    for coordinate in coordinates {
        let lat = (coordinate.lat * PRECISION).round() as i64;
        let lng = (coordinate.lng * PRECISION).round() as i64;
        write_value(lat - prev_lat, &mut encoded);
        write_value(lng - prev_lng, &mut encoded);
        prev_lat = lat;
        prev_lng = lng;
    }

    encoded
}

fn read_value(bytes: &[u8], index: &mut usize) -> Result<i64, DecodeError> {
    let start = *index;
    let mut result: i64 = 0;
    let mut shift = 0;

    for _ in 0..MAX_CHUNKS {
        let Some(&byte) = bytes.get(*index) else {
            return Err(DecodeError::Truncated { offset: *index });
        };
        if !(ASCII_OFFSET..=126).contains(&byte) {
            return Err(DecodeError::InvalidByte {
                offset: *index,
                byte,
            });
        }
        *index += 1;

        let chunk = i64::from(byte - ASCII_OFFSET);
        result |= (chunk & CHUNK_MASK) << shift;
        shift += 5;

        if chunk & CONTINUATION == 0 {
            let delta = if result & 1 != 0 {
                !(result >> 1)
            } else {
                result >> 1
            };
            return Ok(delta);
        }
    }

    Err(DecodeError::Overlong { offset: start })
}

fn write_value(delta: i64, encoded: &mut String) {
    let mut value = if delta < 0 { !(delta << 1) } else { delta << 1 };

    while value >= CONTINUATION {
        let chunk = (CONTINUATION | (value & CHUNK_MASK)) as u8;
        encoded.push(char::from(chunk + ASCII_OFFSET));
        value >>= 5;
    }
    encoded.push(char::from(value as u8 + ASCII_OFFSET));
}
