//! Transport seam between a session controller and a remote conversational endpoint.
//!
//! A transport is opened once per session and yields three things: a bounded
//! outbound queue for encoded capture frames, an event stream of lifecycle signals and
//! response fragments, and a handle that closes the channel.

use crate::audio::frame::EncodedPayload;
use crate::config::AppConfig;
use crate::error::SessionResult;
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Everything needed to open one live session.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    /// Capacity of the outbound frame queue
    pub send_queue_frames: usize,
}

impl LiveSessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.live.endpoint.clone(),
            api_key: config.live.api_key.clone(),
            model: config.live.model.clone(),
            voice: config.live.voice.clone(),
            system_instruction: config.live.system_instruction.clone(),
            send_queue_frames: config.audio.send_queue_frames.max(1),
        }
    }

    /// Model name in the `models/<id>` form the endpoint expects.
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Endpoint URL with the API key attached as a query parameter.
    pub fn connection_url(&self) -> String {
        let separator = if self.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}key={}", self.endpoint, separator, self.api_key)
    }
}

/// Lifecycle signals and response data coming back from the remote endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The channel is ready; capture may start sending.
    Opened,
    /// One inbound audio fragment (one playback unit).
    Fragment { payload: EncodedPayload, is_final: bool },
    /// Model text or transcript.
    Text { text: String },
    /// The remote cancelled its current turn (the user barged in).
    Interrupted,
    Closed { reason: String },
    Error { reason: String },
}

/// Closes the underlying channel. Safe to call any number of times.
#[derive(Debug)]
pub struct TransportHandle {
    shutdown: Option<oneshot::Sender<()>>,
}

impl TransportHandle {
    /// Wrap the shutdown signal of a transport driver.
    pub fn new(shutdown: oneshot::Sender<()>) -> Self {
        Self {
            shutdown: Some(shutdown),
        }
    }

    pub fn close(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            // The driver may already be gone; that is fine
            let _ = shutdown.send(());
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// An open transport session.
pub struct TransportSession {
    pub outbound: mpsc::Sender<EncodedPayload>,
    pub events: mpsc::Receiver<TransportEvent>,
    pub handle: TransportHandle,
}

/// Opens live sessions against a remote endpoint.
///
/// ## Errors:
/// `ConnectError` when the endpoint cannot be reached or rejects the configuration.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, config: &LiveSessionConfig) -> SessionResult<TransportSession>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_path_and_url() {
        let mut config = LiveSessionConfig::from_app_config(&AppConfig::default());
        config.api_key = "secret".to_string();

        assert_eq!(config.model_path(), "models/gemini-2.5-flash-native-audio-preview-09-2025");
        assert!(config.connection_url().ends_with("BidiGenerateContent?key=secret"));

        config.model = "models/custom".to_string();
        assert_eq!(config.model_path(), "models/custom");

        config.endpoint = "wss://example.test/live?alt=json".to_string();
        assert_eq!(config.connection_url(), "wss://example.test/live?alt=json&key=secret");
    }

    #[test]
    fn test_handle_close_is_idempotent() {
        let (tx, mut rx) = oneshot::channel();
        let mut handle = TransportHandle::new(tx);

        handle.close();
        assert!(rx.try_recv().is_ok());

        // A second close (and the drop) must not panic on the spent sender
        handle.close();
        drop(handle);
        assert!(rx.try_recv().is_err());
    }
}
