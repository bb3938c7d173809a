//! # Audio Module
//!
//! Everything that touches samples on their way through a voice session.
//!
//! ## Key Components:
//! - **Codec**: float ⇄ int16 LE ⇄ base64 conversions
//! - **Frame**: `AudioFrame` and the `{ data, mimeType }` wire payload
//! - **Capture**: microphone stream → fixed 4096-sample frames → outbound queue
//! - **Playback**: inbound fragments → gapless units on the output clock
//!
//! ## Audio Formats:
//! - **Capture**: 16 kHz, mono, 16-bit little-endian PCM
//! - **Playback**: 24 kHz, mono, 16-bit little-endian PCM

pub mod capture;
pub mod codec;
pub mod frame;
pub mod playback;
