//! Fixed-shape records for audio moving through a session.
//!
//! `AudioFrame` is what the capture pipeline produces; `EncodedPayload` is the
//! `{ data, mimeType }` shape exchanged with the live endpoint in both directions.

use crate::audio::codec;
use crate::error::SessionResult;
use serde::{Deserialize, Serialize};

/// One captured frame of mono 16-bit little-endian PCM.
///
/// Built once from float samples through `codec::encode_samples` and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pcm: Vec<u8>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn from_float(samples: &[f32], sample_rate: u32) -> Self {
        Self {
            pcm: codec::encode_samples(samples),
            sample_rate,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of samples in the frame.
    pub fn sample_count(&self) -> usize {
        self.pcm.len() / 2
    }

    /// Raw little-endian bytes of the frame.
    pub fn as_bytes(&self) -> &[u8] {
        &self.pcm
    }
}

/// Build the MIME descriptor for raw PCM at `rate`.
pub fn pcm_mime(rate: u32) -> String {
    format!("audio/pcm;rate={}", rate)
}

/// Text-safe audio payload: base64 data plus its MIME descriptor.
///
/// Serializes as `{ "data": "...", "mimeType": "audio/pcm;rate=16000" }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedPayload {
    pub data: String,
    pub mime_type: String,
}

impl EncodedPayload {
    pub fn new(data: String, mime_type: String) -> Self {
        Self { data, mime_type }
    }

    /// Encode a captured frame for sending.
    pub fn from_frame(frame: &AudioFrame) -> Self {
        Self {
            data: codec::bytes_to_text(frame.as_bytes()),
            mime_type: pcm_mime(frame.sample_rate()),
        }
    }

    /// Whether the MIME type describes raw PCM audio.
    pub fn is_pcm_audio(&self) -> bool {
        let mime = self.mime_type.to_ascii_lowercase();
        mime.starts_with("audio/pcm") || mime.starts_with("audio/l16")
    }

    /// The `rate=` parameter of the MIME type, if present and numeric.
    pub fn sample_rate(&self) -> Option<u32> {
        self.mime_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("rate"))
            .and_then(|(_, value)| value.trim().parse().ok())
    }

    /// Decode the base64 data back to raw bytes.
    pub fn to_bytes(&self) -> SessionResult<Vec<u8>> {
        codec::text_to_bytes(&self.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_shape() {
        let frame = AudioFrame::from_float(&[0.5, -0.5], 16000);
        let payload = EncodedPayload::from_frame(&frame);
        let json = serde_json::to_value(&payload).unwrap();

        assert_eq!(json["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(json["data"], codec::bytes_to_text(&[0x00, 0x40, 0x00, 0xC0]));
    }

    #[test]
    fn test_frame_bytes_match_codec() {
        let samples = [0.1f32, -0.2, 0.3, 1.0];
        let frame = AudioFrame::from_float(&samples, 16000);
        assert_eq!(frame.as_bytes(), codec::encode_samples(&samples).as_slice());
        assert_eq!(frame.sample_count(), 4);
    }

    #[test]
    fn test_sample_rate_parsing() {
        let payload = EncodedPayload::new(String::new(), "audio/pcm;rate=24000".into());
        assert_eq!(payload.sample_rate(), Some(24000));
        assert!(payload.is_pcm_audio());

        let payload = EncodedPayload::new(String::new(), "audio/pcm; codec=raw; RATE=16000".into());
        assert_eq!(payload.sample_rate(), Some(16000));

        let payload = EncodedPayload::new(String::new(), "audio/pcm".into());
        assert_eq!(payload.sample_rate(), None);

        let payload = EncodedPayload::new(String::new(), "text/plain".into());
        assert!(!payload.is_pcm_audio());
    }
}
