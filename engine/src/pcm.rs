//! 16-bit little-endian PCM <-> normalized float conversion, plus the base64
//! wrapping used on the session channel.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Decode s16le bytes to floats in [-1, 1). A dangling odd byte is ignored.
pub fn decode_pcm16le(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode floats as s16le, clamping to the representable range.
pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&f32_to_i16(*s).to_le_bytes());
    }
    out
}

#[inline]
pub fn f32_to_i16(s: f32) -> i16 {
    (s * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

pub fn payload_to_base64(payload: &[u8]) -> String {
    STANDARD.encode(payload)
}

pub fn payload_from_base64(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(data)
}
