//! # Voice WebSocket Handler
//!
//! Bridges one browser connection to one voice session. Clients connect to `/ws/voice`;
//! the browser acts as both the microphone and the speaker while the server runs the
//! session controller and talks to the live endpoint.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects, server starts a heartbeat
//! 2. **Start**: client sends `start_session` (with whether microphone permission was granted)
//! 3. **Microphone**: binary messages carry little-endian f32 samples at 16 kHz mono
//! 4. **Speaker**: server sends `playback` units with a start time on the session's output
//!    clock (seconds since the output was opened); the client answers `playback_ended`
//!    when a unit finishes, and must drop a unit when it receives `playback_stop`
//! 5. **Status**: every state change is pushed as `session_status`
//! 6. **Stop**: client sends `stop_session` or simply disconnects
//!
//! ## Message Format:
//! - **Client → Server**: JSON with a `type` tag, or binary microphone samples
//! - **Server → Client**: JSON with a `type` tag

use crate::audio::capture::{MicrophoneDevice, MicrophoneStream, MicrophoneTrack};
use crate::audio::codec::{self, FloatBuffer};
use crate::audio::playback::{AudioOutput, OutputContext, OutputDevice};
use crate::error::{AppError, SessionError, SessionResult};
use crate::session::controller::{SessionConfig, SessionController, SessionDevices, SessionState};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

/// Microphone chunks buffered between the socket and the capture pipeline.
const MICROPHONE_BUFFER_CHUNKS: usize = 64;

fn default_granted() -> bool {
    true
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// WebSocket message types for client-server communication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VoiceMessage {
    /// Start a voice session (client)
    #[serde(rename = "start_session")]
    StartSession {
        /// Optional session ID; generated when absent
        #[serde(default)]
        session_id: Option<String>,
        /// Whether the user granted microphone access in the browser
        #[serde(default = "default_granted")]
        microphone_granted: bool,
    },

    /// Stop the current voice session (client)
    #[serde(rename = "stop_session")]
    StopSession {
        #[serde(default)]
        session_id: Option<String>,
    },

    /// A playback unit finished playing naturally (client)
    #[serde(rename = "playback_ended")]
    PlaybackEnded { unit_id: u64 },

    /// Session state change (server)
    #[serde(rename = "session_status")]
    SessionStatus {
        session_id: String,
        status: String,
        /// True only while the session is active
        listening: bool,
        message: Option<String>,
    },

    /// Audio to play at `start_at` seconds on the session's output clock (server)
    #[serde(rename = "playback")]
    Playback {
        unit_id: u64,
        start_at: f64,
        duration: f64,
        sample_rate: u32,
        channels: u16,
        /// Base64 16-bit little-endian PCM, interleaved
        data: String,
    },

    /// Stop a unit immediately, whether or not it started (server)
    #[serde(rename = "playback_stop")]
    PlaybackStop { unit_id: u64 },

    /// Tutor text or transcript (server)
    #[serde(rename = "tutor_text")]
    TutorText { text: String },

    /// Error messages
    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        session_id: Option<String>,
    },

    /// Heartbeat/ping message
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat/pong response
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

impl VoiceMessage {
    /// Status message for a session state.
    pub fn status(session_id: &str, state: SessionState, message: Option<String>) -> Self {
        VoiceMessage::SessionStatus {
            session_id: session_id.to_string(),
            status: state.as_str().to_string(),
            listening: state == SessionState::Active,
            message,
        }
    }
}

/// Send a message to the browser.
#[derive(Message)]
#[rtype(result = "()")]
struct SendMessage(VoiceMessage);

/// State change of the session owned by this connection.
struct SessionUpdate {
    session_id: String,
    state: SessionState,
}

type MicrophoneFeed = Arc<Mutex<Option<mpsc::Sender<Vec<f32>>>>>;
type CompletionFeed = Arc<Mutex<Option<mpsc::UnboundedSender<u64>>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// What happened to one binary microphone message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FeedOutcome {
    Delivered,
    BufferFull,
    NotListening,
}

/// Decode browser microphone bytes and hand them to the acquired microphone, if any.
fn feed_microphone(feed: &MicrophoneFeed, data: &[u8]) -> SessionResult<FeedOutcome> {
    let samples = codec::decode_f32_le(data)?;
    let Some(sender) = lock(feed).clone() else {
        return Ok(FeedOutcome::NotListening);
    };

    match sender.try_send(samples) {
        Ok(()) => Ok(FeedOutcome::Delivered),
        Err(TrySendError::Full(_)) => Ok(FeedOutcome::BufferFull),
        Err(TrySendError::Closed(_)) => Ok(FeedOutcome::NotListening),
    }
}

/// Pass a `playback_ended` notification to the open output. False once the output is closed.
fn deliver_completion(feed: &CompletionFeed, unit_id: u64) -> bool {
    lock(feed)
        .as_ref()
        .is_some_and(|completions| completions.send(unit_id).is_ok())
}

/// Microphone backed by binary frames arriving on the browser socket.
pub struct RemoteMicrophone {
    granted: bool,
    feed: MicrophoneFeed,
}

impl RemoteMicrophone {
    fn new(granted: bool, feed: MicrophoneFeed) -> Self {
        Self { granted, feed }
    }
}

#[async_trait]
impl MicrophoneDevice for RemoteMicrophone {
    async fn acquire(&self, sample_rate: u32) -> SessionResult<MicrophoneStream> {
        if !self.granted {
            return Err(SessionError::CaptureUnavailable(
                "microphone permission denied by the client".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(MICROPHONE_BUFFER_CHUNKS);
        *lock(&self.feed) = Some(tx);
        debug!(sample_rate, "Remote microphone acquired");

        Ok(MicrophoneStream {
            chunks: rx,
            track: Box::new(RemoteTrack {
                feed: self.feed.clone(),
                live: true,
            }),
        })
    }
}

struct RemoteTrack {
    feed: MicrophoneFeed,
    live: bool,
}

impl MicrophoneTrack for RemoteTrack {
    fn stop(&mut self) {
        if self.live {
            self.live = false;
            lock(&self.feed).take();
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

/// Speaker backed by `playback` messages to the browser.
pub struct RemoteOutput {
    browser: Recipient<SendMessage>,
    completions: CompletionFeed,
}

impl OutputDevice for RemoteOutput {
    fn open(&self, sample_rate: u32, channels: u16) -> SessionResult<OutputContext> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.completions) = Some(tx);
        Ok(OutputContext {
            output: Box::new(RemoteOutputContext {
                browser: self.browser.clone(),
                completions: self.completions.clone(),
                opened_at: Instant::now(),
                sample_rate,
                channels,
                closed: false,
            }),
            completions: rx,
        })
    }
}

struct RemoteOutputContext {
    browser: Recipient<SendMessage>,
    completions: CompletionFeed,
    opened_at: Instant,
    sample_rate: u32,
    channels: u16,
    closed: bool,
}

impl AudioOutput for RemoteOutputContext {
    fn current_time(&self) -> f64 {
        self.opened_at.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, unit_id: u64, buffer: &FloatBuffer, start_at: f64) -> SessionResult<()> {
        if self.closed {
            return Err(SessionError::InvalidState("output is closed".to_string()));
        }
        if !self.browser.connected() {
            return Err(SessionError::TransportError("browser connection is gone".to_string()));
        }
        self.browser.do_send(SendMessage(VoiceMessage::Playback {
            unit_id,
            start_at,
            duration: buffer.duration(),
            sample_rate: self.sample_rate,
            channels: self.channels,
            data: codec::bytes_to_text(&buffer.to_pcm_bytes()),
        }));
        Ok(())
    }

    fn stop(&mut self, unit_id: u64) {
        self.browser.do_send(SendMessage(VoiceMessage::PlaybackStop { unit_id }));
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            lock(&self.completions).take();
        }
    }
}

/// WebSocket actor for one voice connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. The session controller runs its own
/// tasks; it reaches back to the actor only through `Addr::do_send`.
pub struct VoiceWebSocket {
    state: AppState,

    /// Session owned by this connection (at most one at a time)
    session: Option<Arc<SessionController>>,

    /// Last status pushed to the client, to avoid repeats
    last_status: Option<SessionState>,

    /// Where binary microphone frames go while a microphone is acquired
    microphone: MicrophoneFeed,

    /// Where `playback_ended` notifications go while an output is open
    completions: CompletionFeed,

    heartbeat_interval: Duration,
    client_timeout: Duration,
    last_heartbeat: Instant,
    microphone_chunks_dropped: u64,
}

impl VoiceWebSocket {
    pub fn new(state: AppState) -> Self {
        let performance = state.get_config().performance;
        Self {
            state,
            session: None,
            last_status: None,
            microphone: Arc::default(),
            completions: Arc::default(),
            heartbeat_interval: Duration::from_secs(performance.heartbeat_interval_secs),
            client_timeout: Duration::from_secs(performance.client_timeout_secs),
            last_heartbeat: Instant::now(),
            microphone_chunks_dropped: 0,
        }
    }

    fn session_id(&self) -> Option<String> {
        self.session.as_ref().map(|s| s.id().to_string())
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, message: &VoiceMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("Failed to encode WebSocket message: {}", err),
        }
    }

    /// Send error message to client.
    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str, session_id: Option<String>) {
        self.send(
            ctx,
            &VoiceMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
                session_id,
            },
        );
        warn!("WebSocket error {}: {}", code, message);
    }

    fn send_status(&mut self, ctx: &mut ws::WebsocketContext<Self>, session_id: &str, state: SessionState, message: Option<String>) {
        if self.last_status == Some(state) {
            return;
        }
        self.last_status = Some(state);
        self.send(ctx, &VoiceMessage::status(session_id, state, message));
    }

    fn handle_start_session(&mut self, session_id: Option<String>, microphone_granted: bool, ctx: &mut ws::WebsocketContext<Self>) {
        if let Some(current) = &self.session {
            if current.state() != SessionState::Closed {
                let id = current.id().to_string();
                self.send_error(ctx, "session_active", "A voice session is already running on this connection", Some(id));
                return;
            }
            self.finish_session();
        }

        let config = self.state.get_config();
        let devices = SessionDevices {
            microphone: Arc::new(RemoteMicrophone::new(microphone_granted, self.microphone.clone())),
            output: Arc::new(RemoteOutput {
                browser: ctx.address().recipient(),
                completions: self.completions.clone(),
            }),
            transport: self.state.transport.clone(),
        };

        let controller = match self.state.sessions.create_session(
            session_id.clone(),
            SessionConfig::from_app_config(&config),
            devices,
        ) {
            Ok(controller) => controller,
            Err(err) => {
                let code = match err {
                    AppError::SessionLimit(_) => "session_limit",
                    _ => "session_error",
                };
                self.send_error(ctx, code, &err.to_string(), session_id);
                return;
            }
        };

        let id = controller.id().to_string();
        let addr = ctx.address();
        controller.set_text_observer(Arc::new(move |text: &str| {
            addr.do_send(SendMessage(VoiceMessage::TutorText { text: text.to_string() }));
        }));

        let update_id = id.clone();
        ctx.add_stream(WatchStream::new(controller.subscribe()).map(move |state| SessionUpdate {
            session_id: update_id.clone(),
            state,
        }));

        self.session = Some(controller.clone());
        self.last_status = None;
        info!(session_id = %id, microphone_granted, "Voice session requested");

        let state = self.state.clone();
        let addr = ctx.address();
        tokio::spawn(async move {
            let result = controller.start().await;
            state.record_session_start(matches!(&result, Err(err) if *err != SessionError::Cancelled));

            match result {
                Ok(()) | Err(SessionError::Cancelled) => {}
                Err(err) => {
                    addr.do_send(SendMessage(VoiceMessage::Error {
                        code: err.code().to_string(),
                        message: err.to_string(),
                        session_id: Some(id),
                    }));
                }
            }
        });
    }

    fn handle_stop_session(&mut self, ctx: &mut ws::WebsocketContext<Self>) {
        let Some(controller) = self.session.clone() else {
            debug!("stop_session without a session");
            return;
        };
        controller.stop();
        let message = controller.last_error().map(|e| e.to_string());
        self.send_status(ctx, controller.id(), SessionState::Closed, message);
        self.finish_session();
    }

    /// Stop the current session and unregister it, unless it was already removed elsewhere.
    fn finish_session(&mut self) {
        if let Some(controller) = self.session.take() {
            controller.stop();
            let retired = self.state.retire_controller(&controller);
            debug!(session_id = %controller.id(), retired, "Voice session finished");
        }
    }

    /// Hand binary microphone samples to the capture pipeline.
    fn handle_microphone_data(&mut self, data: &[u8], ctx: &mut ws::WebsocketContext<Self>) {
        match feed_microphone(&self.microphone, data) {
            Ok(FeedOutcome::Delivered) => {}
            Ok(FeedOutcome::BufferFull) => {
                self.microphone_chunks_dropped += 1;
                if self.microphone_chunks_dropped == 1 || self.microphone_chunks_dropped % 50 == 0 {
                    warn!(dropped = self.microphone_chunks_dropped, "Microphone buffer full, dropping chunk");
                }
            }
            Ok(FeedOutcome::NotListening) => {
                debug!(bytes = data.len(), "Microphone data without an acquired microphone, ignoring");
            }
            Err(err) => {
                self.send_error(ctx, "audio_error", &err.to_string(), self.session_id());
            }
        }
    }

    fn handle_playback_ended(&self, unit_id: u64) {
        if !deliver_completion(&self.completions, unit_id) {
            debug!(unit_id, "playback_ended with no open output, ignoring");
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("Voice WebSocket connection started");
        self.state.increment_active_connections();

        ctx.run_interval(self.heartbeat_interval, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > act.client_timeout {
                warn!("Voice WebSocket heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                act.send(ctx, &VoiceMessage::Ping { timestamp: now_millis() });
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = ?self.session_id(), "Voice WebSocket connection stopped");
        self.finish_session();
        self.state.decrement_active_connections();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<VoiceMessage>(&text) {
                Ok(VoiceMessage::StartSession { session_id, microphone_granted }) => {
                    self.handle_start_session(session_id, microphone_granted, ctx);
                }
                Ok(VoiceMessage::StopSession { .. }) => self.handle_stop_session(ctx),
                Ok(VoiceMessage::PlaybackEnded { unit_id }) => self.handle_playback_ended(unit_id),
                Ok(VoiceMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.send(ctx, &VoiceMessage::Pong { timestamp });
                }
                Ok(VoiceMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Ok(_) => {
                    warn!("Received server-only message type from client");
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid JSON: {}", err), None);
                }
            },
            Ok(ws::Message::Binary(data)) => self.handle_microphone_data(&data, ctx),
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Voice WebSocket closed: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("WebSocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

impl StreamHandler<SessionUpdate> for VoiceWebSocket {
    fn handle(&mut self, update: SessionUpdate, ctx: &mut Self::Context) {
        let is_current = self
            .session
            .as_ref()
            .is_some_and(|s| s.id() == update.session_id);
        if !is_current {
            return;
        }

        let message = match update.state {
            SessionState::Closed => self
                .session
                .as_ref()
                .and_then(|s| s.last_error())
                .map(|e| e.to_string()),
            _ => None,
        };
        self.send_status(ctx, &update.session_id, update.state, message);

        // The session ended on its own (remote close, error, capture loss)
        if update.state == SessionState::Closed {
            self.finish_session();
        }
    }

    // The watch sender going away must not close the socket
    fn finished(&mut self, _ctx: &mut Self::Context) {}
}

impl Handler<SendMessage> for VoiceWebSocket {
    type Result = ();

    fn handle(&mut self, msg: SendMessage, ctx: &mut Self::Context) {
        self.send(ctx, &msg.0);
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a `VoiceWebSocket` actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New voice WebSocket connection from: {:?}", req.connection_info().peer_addr());
    ws::start(VoiceWebSocket::new(app_state.get_ref().clone()), &req, stream)
}
