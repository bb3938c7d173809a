//! # Live Endpoint Module
//!
//! The transport half of a voice session: a trait seam (`transport`), the JSON wire
//! protocol of the Gemini Live endpoint (`protocol`), and the WebSocket driver that
//! speaks it (`gemini`).

pub mod gemini;
pub mod protocol;
pub mod transport;

pub use gemini::GeminiLiveTransport;
pub use transport::{LiveSessionConfig, Transport, TransportEvent, TransportHandle, TransportSession};
