//! # Gemini Live Transport
//!
//! `Transport` implementation over a `tokio-tungstenite` WebSocket to the Gemini Live
//! `BidiGenerateContent` endpoint.
//!
//! ## Connection Lifecycle:
//! 1. **Connect**: `{endpoint}?key=...` with a connect timeout
//! 2. **Setup**: send the setup message (model, voice, system instruction)
//! 3. **Drive**: one task multiplexes shutdown, outbound frames and inbound messages
//! 4. **Ready**: `setupComplete` arrives and is surfaced as `TransportEvent::Opened`
//! 5. **Close**: on `TransportHandle::close()` the driver sends a Close frame and exits
//!
//! ## Key Rust Concepts:
//! - **`tokio::select!`**: waits on several futures and runs the branch that finishes first
//! - **`StreamExt::split`**: separates the socket into independent read and write halves

use crate::audio::frame::EncodedPayload;
use crate::error::{SessionError, SessionResult};
use crate::live::protocol::{RealtimeInputMessage, ServerMessage, SetupMessage};
use crate::live::transport::{LiveSessionConfig, Transport, TransportEvent, TransportHandle, TransportSession};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info, warn};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 256;

/// Connects sessions to the Gemini Live endpoint.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    connect_timeout: Duration,
}

impl GeminiLiveTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl Default for GeminiLiveTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for GeminiLiveTransport {
    async fn open(&self, config: &LiveSessionConfig) -> SessionResult<TransportSession> {
        if config.api_key.trim().is_empty() {
            return Err(SessionError::ConnectError("no API key configured for the live endpoint".to_string()));
        }

        info!(model = %config.model, voice = %config.voice, "Connecting to live endpoint");

        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(config.connection_url()))
            .await
            .map_err(|_| SessionError::ConnectError(format!("connection timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| SessionError::ConnectError(format!("failed to connect: {}", e)))?;

        let (mut write, read) = socket.split();

        let setup = serde_json::to_string(&SetupMessage::from_config(config))
            .map_err(|e| SessionError::ConnectError(format!("failed to encode setup message: {}", e)))?;
        write
            .send(Message::Text(setup))
            .await
            .map_err(|e| SessionError::ConnectError(format!("failed to send setup message: {}", e)))?;

        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_frames.max(1));
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(drive(write, read, outbound_rx, event_tx, shutdown_rx));

        Ok(TransportSession {
            outbound: outbound_tx,
            events: event_rx,
            handle: TransportHandle::new(shutdown_tx),
        })
    }
}

/// Pump messages in both directions until shutdown, remote close, or error.
///
/// Generic over the socket halves so it can run against any message sink and stream.
async fn drive<W, R>(
    mut write: W,
    mut read: R,
    mut outbound: mpsc::Receiver<EncodedPayload>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: oneshot::Receiver<()>,
) where
    W: Sink<Message, Error = WsError> + Unpin,
    R: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut outbound_open = true;
    let mut frames_sent: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                match tokio::time::timeout(CLOSE_TIMEOUT, write.send(Message::Close(None))).await {
                    Ok(Ok(())) => debug!("Live socket closed"),
                    Ok(Err(e)) => debug!("Live socket close error: {}", e),
                    Err(_) => debug!("Live socket close timed out"),
                }
                break;
            }

            payload = outbound.recv(), if outbound_open => {
                let Some(payload) = payload else {
                    // Sender gone: keep receiving until told to shut down
                    outbound_open = false;
                    continue;
                };
                let text = match serde_json::to_string(&RealtimeInputMessage::single(payload)) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode outbound frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    let _ = events.send(TransportEvent::Error { reason: format!("send failed: {}", e) }).await;
                    break;
                }
                frames_sent += 1;
            }

            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        if !dispatch(&text, &events).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if !dispatch(&text, &events).await {
                                break;
                            }
                        }
                        Err(_) => warn!("Ignoring non-UTF-8 binary message from live endpoint"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("closed by remote ({}): {}", u16::from(f.code), f.reason))
                            .unwrap_or_else(|| "closed by remote".to_string());
                        let _ = events.send(TransportEvent::Closed { reason }).await;
                        break;
                    }
                    // Ping/pong are answered by tungstenite
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error { reason: e.to_string() }).await;
                        break;
                    }
                    None => {
                        let _ = events.send(TransportEvent::Closed { reason: "connection ended".to_string() }).await;
                        break;
                    }
                }
            }
        }
    }

    debug!(frames_sent, "Live transport driver finished");
}

/// Parse one server message and forward its events. Returns false once the receiver is gone.
async fn dispatch(text: &str, events: &mpsc::Sender<TransportEvent>) -> bool {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Ignoring unparseable live message: {}", e);
            return true;
        }
    };

    if let Some(go_away) = &message.go_away {
        warn!(time_left = ?go_away.time_left, "Live endpoint announced it will close the session");
    }

    for event in message.into_events() {
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use futures_channel::mpsc as fmpsc;
    use serde_json::json;

    struct Harness {
        sent: fmpsc::UnboundedReceiver<Message>,
        incoming: fmpsc::UnboundedSender<Result<Message, WsError>>,
        outbound: mpsc::Sender<EncodedPayload>,
        events: mpsc::Receiver<TransportEvent>,
        handle: TransportHandle,
        driver: tokio::task::JoinHandle<()>,
    }

    fn harness() -> Harness {
        let (sink_tx, sink_rx) = fmpsc::unbounded::<Message>();
        let (incoming_tx, incoming_rx) = fmpsc::unbounded::<Result<Message, WsError>>();
        let (outbound_tx, outbound_rx) = mpsc::channel(4);
        let (event_tx, event_rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let write = sink_tx.sink_map_err(|_| WsError::ConnectionClosed);
        let driver = tokio::spawn(drive(write, incoming_rx, outbound_rx, event_tx, shutdown_rx));

        Harness {
            sent: sink_rx,
            incoming: incoming_tx,
            outbound: outbound_tx,
            events: event_rx,
            handle: TransportHandle::new(shutdown_tx),
            driver,
        }
    }

    #[tokio::test]
    async fn test_open_without_api_key_is_connect_error() {
        let config = LiveSessionConfig::from_app_config(&AppConfig::default());
        let result = GeminiLiveTransport::new().open(&config).await;
        assert!(matches!(result, Err(SessionError::ConnectError(_))));
    }

    #[tokio::test]
    async fn test_outbound_frames_are_wrapped_in_realtime_input() {
        let mut h = harness();
        h.outbound
            .send(EncodedPayload::new("AAA=".into(), "audio/pcm;rate=16000".into()))
            .await
            .unwrap();

        let sent = h.sent.next().await.unwrap();
        let Message::Text(text) = sent else { panic!("expected text frame") };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["realtimeInput"]["mediaChunks"][0]["mimeType"], "audio/pcm;rate=16000");
    }

    #[tokio::test]
    async fn test_inbound_messages_become_events() {
        let mut h = harness();
        h.incoming
            .unbounded_send(Ok(Message::Text(r#"{"setupComplete":{}}"#.into())))
            .unwrap();
        let audio = json!({
            "serverContent": { "modelTurn": { "parts": [
                { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AAAA" } }
            ] } }
        });
        h.incoming
            .unbounded_send(Ok(Message::Binary(audio.to_string().into_bytes())))
            .unwrap();
        h.incoming.unbounded_send(Ok(Message::Text("not json".into()))).unwrap();
        h.incoming.unbounded_send(Ok(Message::Close(None))).unwrap();

        assert_eq!(h.events.recv().await, Some(TransportEvent::Opened));
        assert!(matches!(h.events.recv().await, Some(TransportEvent::Fragment { .. })));
        assert!(matches!(h.events.recv().await, Some(TransportEvent::Closed { .. })));
        h.driver.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_and_stops_driver() {
        let mut h = harness();
        h.handle.close();
        h.driver.await.unwrap();

        assert!(matches!(h.sent.next().await, Some(Message::Close(None))));
        // Driver dropped its event sender without reporting anything
        assert_eq!(h.events.recv().await, None);
    }

    #[tokio::test]
    async fn test_stream_end_reports_closed() {
        let mut h = harness();
        drop(h.incoming);
        assert!(matches!(h.events.recv().await, Some(TransportEvent::Closed { .. })));
    }
}
