//! # PCM Codec
//!
//! Converts between the representations audio takes on its way through a voice session:
//!
//! - **Float samples** in [-1.0, 1.0] (microphone input, playback buffers)
//! - **16-bit little-endian PCM bytes** (the wire format in both directions)
//! - **Base64 text** (so bytes can travel inside JSON messages)
//!
//! ## Round-trip law:
//! `decode_to_float_buffer(text_to_bytes(bytes_to_text(encode_samples(x))))` reproduces
//! `x` to within one int16 quantization step (1/32768 per sample).

use crate::error::{SessionError, SessionResult};
use base64::Engine as _;
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Scale between float samples and int16 samples.
pub const PCM_SCALE: f32 = 32768.0;

/// Encode float samples as 16-bit little-endian PCM.
///
/// ## Conversion:
/// Each sample is multiplied by 32768 and truncated toward zero. Values outside
/// the int16 range saturate at -32768 / 32767 instead of wrapping around, so a
/// full-scale `1.0` becomes `32767` rather than flipping to `-32768`.
pub fn encode_samples(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        // `as` saturates for floats (NaN becomes 0)
        let value = (sample * PCM_SCALE) as i16;
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Encode bytes as base64 text for JSON transport.
pub fn bytes_to_text(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode base64 text back to the original bytes.
pub fn text_to_bytes(text: &str) -> SessionResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| SessionError::DecodeError(format!("invalid base64 payload: {}", e)))
}

/// Parse little-endian 32-bit float samples (the browser microphone format).
pub fn decode_f32_le(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(SessionError::DecodeError(format!(
            "float sample data length {} is not a multiple of 4",
            bytes.len()
        )));
    }

    let mut samples = vec![0.0f32; bytes.len() / 4];
    LittleEndian::read_f32_into(bytes, &mut samples);
    Ok(samples)
}

/// Decoded multi-channel audio, one `Vec<f32>` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl FloatBuffer {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    /// Playback duration in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// Re-interleave the channels as 16-bit little-endian PCM.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let frames = self.frames();
        let mut interleaved = Vec::with_capacity(frames * self.channel_count());
        for i in 0..frames {
            for channel in &self.channels {
                interleaved.push(channel[i]);
            }
        }
        encode_samples(&interleaved)
    }
}

/// Decode interleaved 16-bit little-endian PCM into a float buffer.
///
/// ## Layout:
/// Samples are interleaved per frame: `[c0, c1, ..., c0, c1, ...]`.
/// Frame count is `bytes.len() / 2 / channels`; a trailing partial frame is ignored.
///
/// ## Errors:
/// An odd byte count or a zero channel count cannot describe 16-bit audio and is
/// reported as a `DecodeError`.
pub fn decode_to_float_buffer(bytes: &[u8], sample_rate: u32, channels: u16) -> SessionResult<FloatBuffer> {
    if channels == 0 {
        return Err(SessionError::DecodeError("channel count must be at least 1".to_string()));
    }
    if bytes.len() % 2 != 0 {
        return Err(SessionError::DecodeError(format!(
            "PCM data length {} is odd, expected whole 16-bit samples",
            bytes.len()
        )));
    }

    let channel_count = channels as usize;
    let frame_count = bytes.len() / 2 / channel_count;
    let mut output = vec![Vec::with_capacity(frame_count); channel_count];

    let mut cursor = Cursor::new(bytes);
    for _ in 0..frame_count {
        for channel in output.iter_mut() {
            let sample = cursor
                .read_i16::<LittleEndian>()
                .map_err(|e| SessionError::DecodeError(format!("truncated PCM data: {}", e)))?;
            channel.push(sample as f32 / PCM_SCALE);
        }
    }

    Ok(FloatBuffer {
        sample_rate,
        channels: output,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_within_quantization() {
        let input: Vec<f32> = (0..4096)
            .map(|i| ((i as f32) * 0.013).sin() * 0.9)
            .chain([0.0, 1.0, -1.0, 0.5, -0.5, 1.0 / 32768.0])
            .collect();

        let text = bytes_to_text(&encode_samples(&input));
        let bytes = text_to_bytes(&text).unwrap();
        let buffer = decode_to_float_buffer(&bytes, 16000, 1).unwrap();

        assert_eq!(buffer.frames(), input.len());
        for (original, decoded) in input.iter().zip(buffer.channel(0).unwrap()) {
            let diff = (original - decoded).abs();
            assert!(diff <= 1.0 / PCM_SCALE, "sample {} decoded as {}", original, decoded);
        }
    }

    #[test]
    fn test_full_scale_saturates_instead_of_wrapping() {
        let bytes = encode_samples(&[1.0, -1.0, 2.5, -3.0]);
        let mut cursor = Cursor::new(bytes);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 32767);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), -32768);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), 32767);
        assert_eq!(cursor.read_i16::<LittleEndian>().unwrap(), -32768);
    }

    #[test]
    fn test_encode_is_little_endian() {
        // 0.5 * 32768 = 16384 = 0x4000
        assert_eq!(encode_samples(&[0.5]), vec![0x00, 0x40]);
    }

    #[test]
    fn test_decode_deinterleaves_stereo() {
        let bytes = encode_samples(&[0.25, -0.25, 0.5, -0.5, 0.75]);
        let buffer = decode_to_float_buffer(&bytes, 24000, 2).unwrap();

        // Trailing partial frame is dropped
        assert_eq!(buffer.frames(), 2);
        assert_eq!(buffer.channel(0).unwrap(), &[0.25, 0.5]);
        assert_eq!(buffer.channel(1).unwrap(), &[-0.25, -0.5]);
    }

    #[test]
    fn test_decode_rejects_odd_length_and_zero_channels() {
        assert!(matches!(
            decode_to_float_buffer(&[0u8; 3], 24000, 1),
            Err(SessionError::DecodeError(_))
        ));
        assert!(matches!(
            decode_to_float_buffer(&[0u8; 4], 24000, 0),
            Err(SessionError::DecodeError(_))
        ));
    }

    #[test]
    fn test_invalid_base64_is_decode_error() {
        assert!(matches!(text_to_bytes("not base64!!"), Err(SessionError::DecodeError(_))));
    }

    #[test]
    fn test_duration_matches_sample_rate() {
        let buffer = decode_to_float_buffer(&vec![0u8; 24000], 24000, 1).unwrap();
        assert_eq!(buffer.frames(), 12000);
        assert!((buffer.duration() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_decode_f32_le() {
        let mut bytes = Vec::new();
        bytes.write_f32::<LittleEndian>(0.25).unwrap();
        bytes.write_f32::<LittleEndian>(-1.0).unwrap();
        assert_eq!(decode_f32_le(&bytes).unwrap(), vec![0.25, -1.0]);
        assert!(decode_f32_le(&bytes[..7]).is_err());
    }

    #[test]
    fn test_to_pcm_bytes_reinterleaves() {
        let original = encode_samples(&[0.25, -0.25, 0.5, -0.5]);
        let buffer = decode_to_float_buffer(&original, 24000, 2).unwrap();
        assert_eq!(buffer.to_pcm_bytes(), original);
    }
}
