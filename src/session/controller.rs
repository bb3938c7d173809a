//! # Session Controller
//!
//! Owns every resource of one voice session and drives it through its lifecycle:
//!
//! ```text
//! IDLE --start()--> CONNECTING --Opened--> ACTIVE --Fragment--> ACTIVE
//!                        |                   |
//!                        +---- stop() / Closed / Error / capture failure ----+
//!                                                                            v
//!                                    CLOSED <--teardown complete-- CLOSING
//! ```
//!
//! ## Teardown:
//! Every fatal path and every `stop()` funnels into one teardown routine which runs
//! exactly once per session start: capture stops, the microphone track is released,
//! the transport is closed, in-flight playback units are force-stopped, and the output
//! is closed. A `CLOSED` controller may be started again.
//!
//! ## Stale callbacks:
//! Each `start()` bumps a generation counter. Every asynchronous continuation (the
//! remaining steps of `start()` after an await, transport events, playback completions,
//! capture failures) checks that its generation is still current and that the state
//! allows it before touching anything. A fragment that arrives after `stop()` is dropped.
//!
//! ## Key Rust Concepts:
//! - **`std::sync::Mutex`**: guards all mutable session state; it is never held across an `.await`
//! - **`tokio::sync::watch`**: publishes state changes to any number of observers
//! - **`tokio::select!`**: one event loop task per session start multiplexes all callbacks

use crate::audio::capture::{
    CaptureConfig, CaptureCounters, CaptureHandle, CapturePipeline, MicrophoneDevice, MicrophoneTrack,
};
use crate::audio::frame::EncodedPayload;
use crate::audio::playback::{OutputDevice, PlaybackScheduler};
use crate::config::AppConfig;
use crate::error::{SessionError, SessionResult};
use crate::live::transport::{LiveSessionConfig, Transport, TransportEvent, TransportHandle};
use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a session controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Whether a session in this state holds resources that teardown must release.
    pub fn is_running(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub capture: CaptureConfig,
    pub playback_sample_rate: u32,
    pub playback_channels: u16,
    pub live: LiveSessionConfig,
}

impl SessionConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            capture: CaptureConfig {
                sample_rate: config.audio.capture_sample_rate,
                frame_size: config.audio.frame_size,
            },
            playback_sample_rate: config.audio.playback_sample_rate,
            playback_channels: config.audio.playback_channels,
            live: LiveSessionConfig::from_app_config(config),
        }
    }
}

/// The external collaborators a session needs.
#[derive(Clone)]
pub struct SessionDevices {
    pub microphone: Arc<dyn MicrophoneDevice>,
    pub output: Arc<dyn OutputDevice>,
    pub transport: Arc<dyn Transport>,
}

/// Receives model text and transcripts as they arrive.
pub type TextObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Point-in-time view of a session's counters.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub state: SessionState,
    pub generation: u64,
    pub teardowns: u64,
    pub fragments_scheduled: u64,
    pub fragments_dropped: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub in_flight: usize,
    pub output_clock: Option<f64>,
    pub last_error: Option<String>,
}

/// Resources owned by the current session start. All of them are released by teardown.
#[derive(Default)]
struct Resources {
    track: Option<Box<dyn MicrophoneTrack>>,
    chunks: Option<mpsc::Receiver<Vec<f32>>>,
    scheduler: Option<PlaybackScheduler>,
    transport: Option<TransportHandle>,
    outbound: Option<mpsc::Sender<EncodedPayload>>,
    failures: Option<mpsc::UnboundedSender<SessionError>>,
    capture: Option<CaptureHandle>,
    event_loop: Option<JoinHandle<()>>,
}

struct Inner {
    state: SessionState,
    generation: u64,
    resources: Resources,
    teardowns: u64,
    fragments_scheduled: u64,
    fragments_dropped: u64,
    last_error: Option<SessionError>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation == generation && self.state.is_running()
    }
}

/// State shared between the controller and its event loop task.
struct Shared {
    id: String,
    config: SessionConfig,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    capture_counters: Arc<CaptureCounters>,
    text_observer: Mutex<Option<TextObserver>>,
}

/// Orchestrates one voice session: microphone, output, transport and playback.
pub struct SessionController {
    shared: Arc<Shared>,
    devices: SessionDevices,
}

impl SessionController {
    pub fn new(id: impl Into<String>, config: SessionConfig, devices: SessionDevices) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                id: id.into(),
                config,
                inner: Mutex::new(Inner {
                    state: SessionState::Idle,
                    generation: 0,
                    resources: Resources::default(),
                    teardowns: 0,
                    fragments_scheduled: 0,
                    fragments_dropped: 0,
                    last_error: None,
                }),
                state_tx,
                capture_counters: Arc::new(CaptureCounters::default()),
                text_observer: Mutex::new(None),
            }),
            devices,
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    /// True only while the session is `Active`.
    pub fn is_listening(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn set_text_observer(&self, observer: TextObserver) {
        *self.shared.text_observer.lock().unwrap_or_else(|e| e.into_inner()) = Some(observer);
    }

    /// Start a session.
    ///
    /// ## Sequence:
    /// 1. `Idle`/`Closed` → `Connecting`, new generation
    /// 2. Acquire the microphone (denial tears down, transport is never opened)
    /// 3. Open the output device
    /// 4. Open the transport
    /// 5. Spawn the event loop; capture starts when the transport reports `Opened`
    ///
    /// Returns once the transport is open, while the state is still `Connecting`.
    ///
    /// ## Errors:
    /// - `InvalidState` if a session is already running
    /// - `CaptureUnavailable` / `ConnectError` after a full teardown
    /// - `Cancelled` if `stop()` was called while this start was suspended
    pub async fn start(&self) -> SessionResult<()> {
        let config = &self.shared.config;

        let generation = {
            let mut inner = self.shared.lock();
            if !matches!(inner.state, SessionState::Idle | SessionState::Closed) {
                return Err(SessionError::InvalidState(format!(
                    "cannot start a session that is {}",
                    inner.state
                )));
            }
            inner.generation += 1;
            inner.last_error = None;
            self.shared.set_state(&mut inner, SessionState::Connecting);
            inner.generation
        };
        info!(session_id = %self.shared.id, generation, "Starting voice session");

        // Microphone
        let microphone = match self.devices.microphone.acquire(config.capture.sample_rate).await {
            Ok(microphone) => microphone,
            Err(err) => return Err(self.shared.fail_start(generation, err)),
        };
        {
            let mut inner = self.shared.lock();
            if !inner.is_current(generation) {
                drop(inner);
                let mut track = microphone.track;
                track.stop();
                return Err(SessionError::Cancelled);
            }
            inner.resources.track = Some(microphone.track);
            inner.resources.chunks = Some(microphone.chunks);
        }
        debug!(session_id = %self.shared.id, "Microphone acquired");

        // Output
        let context = match self
            .devices
            .output
            .open(config.playback_sample_rate, config.playback_channels)
        {
            Ok(context) => context,
            Err(err) => return Err(self.shared.fail_start(generation, err)),
        };
        let completions = context.completions;
        {
            let mut inner = self.shared.lock();
            if !inner.is_current(generation) {
                drop(inner);
                let mut output = context.output;
                output.close();
                return Err(SessionError::Cancelled);
            }
            inner.resources.scheduler = Some(PlaybackScheduler::new(
                context.output,
                config.playback_sample_rate,
                config.playback_channels,
            ));
        }

        // Transport
        let session = match self.devices.transport.open(&config.live).await {
            Ok(session) => session,
            Err(err) => return Err(self.shared.fail_start(generation, err)),
        };
        let mut inner = self.shared.lock();
        if !inner.is_current(generation) {
            drop(inner);
            let mut handle = session.handle;
            handle.close();
            return Err(SessionError::Cancelled);
        }

        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        inner.resources.transport = Some(session.handle);
        inner.resources.outbound = Some(session.outbound);
        inner.resources.failures = Some(failures_tx);
        inner.resources.event_loop = Some(tokio::spawn(run_event_loop(
            self.shared.clone(),
            generation,
            session.events,
            completions,
            failures_rx,
        )));
        debug!(session_id = %self.shared.id, generation, "Transport open, waiting for ready signal");

        Ok(())
    }

    /// Stop the session. Safe to call in any state and any number of times.
    ///
    /// Teardown runs synchronously before this returns.
    pub fn stop(&self) {
        let mut inner = self.shared.lock();
        if inner.state.is_running() {
            info!(session_id = %self.shared.id, state = %inner.state, "Stopping voice session");
            self.shared.teardown(&mut inner, None);
        } else {
            debug!(session_id = %self.shared.id, state = %inner.state, "Stop ignored, session not running");
        }
    }

    pub fn stats(&self) -> SessionStats {
        let inner = self.shared.lock();
        let scheduler = inner.resources.scheduler.as_ref();
        SessionStats {
            state: inner.state,
            generation: inner.generation,
            teardowns: inner.teardowns,
            fragments_scheduled: inner.fragments_scheduled,
            fragments_dropped: inner.fragments_dropped,
            frames_sent: self.shared.capture_counters.frames_sent(),
            frames_dropped: self.shared.capture_counters.frames_dropped(),
            in_flight: scheduler.map_or(0, |s| s.in_flight_count()),
            output_clock: scheduler.map(|s| s.clock().next()),
            last_error: inner.last_error.as_ref().map(ToString::to_string),
        }
    }

    pub fn last_error(&self) -> Option<SessionError> {
        self.shared.lock().last_error.clone()
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: SessionState) {
        debug!(session_id = %self.id, from = %inner.state, to = %state, "Session state change");
        inner.state = state;
        self.state_tx.send_replace(state);
    }

    /// A step of `start()` failed. Tear down if that start is still current.
    fn fail_start(&self, generation: u64, err: SessionError) -> SessionError {
        let mut inner = self.lock();
        if inner.is_current(generation) {
            warn!(session_id = %self.id, error = %err, "Voice session failed to start");
            self.teardown(&mut inner, Some(err.clone()));
            err
        } else {
            debug!(session_id = %self.id, error = %err, "Start failed after stop, ignoring");
            SessionError::Cancelled
        }
    }

    /// Release everything owned by the current start. The caller has checked the state is running.
    fn teardown(&self, inner: &mut Inner, error: Option<SessionError>) {
        self.set_state(inner, SessionState::Closing);
        let resources = std::mem::take(&mut inner.resources);

        if let Some(mut capture) = resources.capture {
            capture.stop();
        }
        if let Some(mut track) = resources.track {
            track.stop();
        }
        if let Some(mut transport) = resources.transport {
            transport.close();
        }
        let mut stopped = 0;
        if let Some(mut scheduler) = resources.scheduler {
            stopped = scheduler.stop_all();
            scheduler.close();
        }
        drop(resources.chunks);
        drop(resources.outbound);
        drop(resources.failures);
        if let Some(event_loop) = resources.event_loop {
            event_loop.abort();
        }

        inner.teardowns += 1;
        match &error {
            Some(err) => error!(session_id = %self.id, error = %err, stopped_units = stopped, "Voice session torn down"),
            None => info!(session_id = %self.id, stopped_units = stopped, "Voice session torn down"),
        }
        inner.last_error = error;
        self.set_state(inner, SessionState::Closed);
    }

    /// Handle one transport event. Returns false when the event loop should exit.
    fn handle_event(&self, generation: u64, event: TransportEvent) -> bool {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            debug!(session_id = %self.id, generation, "Ignoring event for a stale session");
            return false;
        }

        match event {
            TransportEvent::Opened => {
                if inner.state != SessionState::Connecting {
                    debug!(session_id = %self.id, "Duplicate ready signal ignored");
                    return true;
                }
                self.set_state(&mut inner, SessionState::Active);
                self.start_capture(&mut inner);
                info!(session_id = %self.id, "Voice session active");
            }
            TransportEvent::Fragment { payload, is_final } => {
                if inner.state != SessionState::Active {
                    debug!(session_id = %self.id, state = %inner.state, "Fragment before ready signal dropped");
                    return true;
                }
                let Some(scheduler) = inner.resources.scheduler.as_mut() else {
                    return true;
                };
                match scheduler.schedule_fragment(&payload) {
                    Ok(unit) => {
                        inner.fragments_scheduled += 1;
                        if is_final {
                            debug!(session_id = %self.id, unit_id = unit.id, ends_at = unit.end_at(), "Final fragment of turn scheduled");
                        }
                    }
                    Err(err) if !err.is_fatal() => {
                        inner.fragments_dropped += 1;
                        warn!(session_id = %self.id, error = %err, "Dropping undecodable fragment");
                    }
                    Err(err) => {
                        self.teardown(&mut inner, Some(err));
                        return false;
                    }
                }
            }
            TransportEvent::Text { text } => {
                drop(inner);
                debug!(session_id = %self.id, chars = text.len(), "Tutor text received");
                let observer = self
                    .text_observer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone();
                if let Some(observer) = observer {
                    observer(&text);
                }
            }
            TransportEvent::Interrupted => {
                if let Some(scheduler) = inner.resources.scheduler.as_mut() {
                    let stopped = scheduler.interrupt();
                    info!(session_id = %self.id, stopped, "Turn interrupted, playback cleared");
                }
            }
            TransportEvent::Closed { reason } => {
                info!(session_id = %self.id, %reason, "Transport closed");
                self.teardown(&mut inner, None);
                return false;
            }
            TransportEvent::Error { reason } => {
                self.teardown(&mut inner, Some(SessionError::TransportError(reason)));
                return false;
            }
        }
        true
    }

    fn start_capture(&self, inner: &mut Inner) {
        let resources = &mut inner.resources;
        let (Some(chunks), Some(outbound), Some(failures)) = (
            resources.chunks.take(),
            resources.outbound.clone(),
            resources.failures.clone(),
        ) else {
            warn!(session_id = %self.id, "Capture resources missing, not starting capture");
            return;
        };
        resources.capture = Some(CapturePipeline::start(
            chunks,
            outbound,
            self.config.capture,
            self.capture_counters.clone(),
            failures,
        ));
    }

    fn on_unit_ended(&self, generation: u64, unit_id: u64) {
        let mut inner = self.lock();
        if !inner.is_current(generation) {
            return;
        }
        if let Some(scheduler) = inner.resources.scheduler.as_mut() {
            if !scheduler.on_ended(unit_id) {
                debug!(session_id = %self.id, unit_id, "Completion for unknown unit");
            }
        }
    }

    /// Tear down for a fatal condition if `generation` is still running.
    fn fail(&self, generation: u64, err: SessionError) {
        let mut inner = self.lock();
        if inner.is_current(generation) {
            self.teardown(&mut inner, Some(err));
        }
    }
}

/// Per-start event loop: transport events, playback completions and capture failures.
async fn run_event_loop(
    shared: Arc<Shared>,
    generation: u64,
    mut events: mpsc::Receiver<TransportEvent>,
    mut completions: mpsc::UnboundedReceiver<u64>,
    mut failures: mpsc::UnboundedReceiver<SessionError>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if !shared.handle_event(generation, event) {
                        break;
                    }
                }
                None => {
                    shared.fail(generation, SessionError::TransportError("transport event stream ended".to_string()));
                    break;
                }
            },
            Some(unit_id) = completions.recv() => shared.on_unit_ended(generation, unit_id),
            Some(err) = failures.recv() => {
                shared.fail(generation, err);
                break;
            }
        }
    }
    debug!(session_id = %shared.id, generation, "Session event loop finished");
}
