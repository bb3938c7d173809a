//! In-memory collaborators for exercising sessions without a browser or network.

use crate::audio::capture::{MicrophoneDevice, MicrophoneStream, MicrophoneTrack};
use crate::audio::codec::{self, FloatBuffer};
use crate::audio::frame::{pcm_mime, EncodedPayload};
use crate::audio::playback::{AudioOutput, OutputContext, OutputDevice};
use crate::error::{SessionError, SessionResult};
use crate::live::transport::{LiveSessionConfig, Transport, TransportEvent, TransportHandle, TransportSession};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot::error::TryRecvError;
use tokio::sync::{mpsc, oneshot, Notify};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Wait until `condition` holds, failing the test after two seconds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// A PCM fragment of `seconds` length at `rate`, as the live endpoint would send it.
pub fn pcm_fragment(seconds: f64, rate: u32) -> EncodedPayload {
    let samples = vec![0.1f32; (seconds * rate as f64).round() as usize];
    EncodedPayload::new(codec::bytes_to_text(&codec::encode_samples(&samples)), pcm_mime(rate))
}

#[derive(Default)]
struct MicrophoneState {
    acquisitions: usize,
    stops: usize,
    live_tracks: usize,
    chunks: Option<mpsc::Sender<Vec<f32>>>,
}

/// Microphone that is either always granted or always denied.
#[derive(Clone)]
pub struct ScriptedMicrophone {
    granted: bool,
    state: Arc<Mutex<MicrophoneState>>,
}

impl ScriptedMicrophone {
    pub fn granted() -> Self {
        Self {
            granted: true,
            state: Arc::default(),
        }
    }

    pub fn denied() -> Self {
        Self {
            granted: false,
            state: Arc::default(),
        }
    }

    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }

    pub fn stops(&self) -> usize {
        lock(&self.state).stops
    }

    pub fn live_tracks(&self) -> usize {
        lock(&self.state).live_tracks
    }

    /// Sender feeding the most recently acquired stream.
    pub fn chunk_sender(&self) -> Option<mpsc::Sender<Vec<f32>>> {
        lock(&self.state).chunks.clone()
    }

    /// End the current stream as if the device disappeared.
    pub fn end_stream(&self) {
        lock(&self.state).chunks = None;
    }
}

#[async_trait]
impl MicrophoneDevice for ScriptedMicrophone {
    async fn acquire(&self, _sample_rate: u32) -> SessionResult<MicrophoneStream> {
        if !self.granted {
            return Err(SessionError::CaptureUnavailable("permission denied".to_string()));
        }
        let (tx, rx) = mpsc::channel(16);
        let mut state = lock(&self.state);
        state.acquisitions += 1;
        state.live_tracks += 1;
        state.chunks = Some(tx);
        Ok(MicrophoneStream {
            chunks: rx,
            track: Box::new(ScriptedTrack {
                live: true,
                state: self.state.clone(),
            }),
        })
    }
}

struct ScriptedTrack {
    live: bool,
    state: Arc<Mutex<MicrophoneState>>,
}

impl MicrophoneTrack for ScriptedTrack {
    fn stop(&mut self) {
        if self.live {
            self.live = false;
            let mut state = lock(&self.state);
            state.stops += 1;
            state.live_tracks -= 1;
        }
    }

    fn is_live(&self) -> bool {
        self.live
    }
}

#[derive(Default)]
struct OutputState {
    now: f64,
    opens: usize,
    scheduled: Vec<(u64, f64, f64)>,
    stopped: Vec<u64>,
    close_calls: usize,
    completions: Option<mpsc::UnboundedSender<u64>>,
}

/// Output device with a clock the test moves by hand.
#[derive(Clone, Default)]
pub struct VirtualOutputDevice {
    state: Arc<Mutex<OutputState>>,
}

impl VirtualOutputDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_time(&self, now: f64) {
        lock(&self.state).now = now;
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// `(unit_id, start_at, duration)` for every schedule call.
    pub fn scheduled(&self) -> Vec<(u64, f64, f64)> {
        lock(&self.state).scheduled.clone()
    }

    pub fn scheduled_starts(&self) -> Vec<f64> {
        lock(&self.state).scheduled.iter().map(|(_, start, _)| *start).collect()
    }

    pub fn stopped(&self) -> Vec<u64> {
        lock(&self.state).stopped.clone()
    }

    pub fn close_calls(&self) -> usize {
        lock(&self.state).close_calls
    }

    /// Report that a unit played to its end.
    pub fn finish(&self, unit_id: u64) {
        if let Some(completions) = &lock(&self.state).completions {
            let _ = completions.send(unit_id);
        }
    }
}

impl OutputDevice for VirtualOutputDevice {
    fn open(&self, _sample_rate: u32, _channels: u16) -> SessionResult<OutputContext> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = lock(&self.state);
        state.opens += 1;
        state.completions = Some(tx);
        Ok(OutputContext {
            output: Box::new(VirtualOutput {
                state: self.state.clone(),
            }),
            completions: rx,
        })
    }
}

struct VirtualOutput {
    state: Arc<Mutex<OutputState>>,
}

impl AudioOutput for VirtualOutput {
    fn current_time(&self) -> f64 {
        lock(&self.state).now
    }

    fn schedule(&mut self, unit_id: u64, buffer: &FloatBuffer, start_at: f64) -> SessionResult<()> {
        lock(&self.state).scheduled.push((unit_id, start_at, buffer.duration()));
        Ok(())
    }

    fn stop(&mut self, unit_id: u64) {
        lock(&self.state).stopped.push(unit_id);
    }

    fn close(&mut self) {
        lock(&self.state).close_calls += 1;
    }
}

#[derive(Default)]
struct TransportState {
    opens: usize,
    fail_with: Option<String>,
    gate: Option<Arc<Notify>>,
    events: Option<mpsc::Sender<TransportEvent>>,
    outbound: Option<mpsc::Receiver<EncodedPayload>>,
    shutdown: Option<oneshot::Receiver<()>>,
}

/// Transport whose events are pushed by the test.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    state: Arc<Mutex<TransportState>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// `open()` fails with a `ConnectError`.
    pub fn failing(reason: &str) -> Self {
        let transport = Self::default();
        lock(&transport.state).fail_with = Some(reason.to_string());
        transport
    }

    /// `open()` suspends until `release()` is called.
    pub fn gated() -> Self {
        let transport = Self::default();
        lock(&transport.state).gate = Some(Arc::new(Notify::new()));
        transport
    }

    pub fn release(&self) {
        if let Some(gate) = &lock(&self.state).gate {
            gate.notify_one();
        }
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    /// Deliver an event to the session. Ignored if the session stopped listening.
    pub async fn emit(&self, event: TransportEvent) {
        let events = lock(&self.state).events.clone();
        if let Some(events) = events {
            let _ = events.send(event).await;
        }
    }

    pub fn take_outbound(&self) -> Option<mpsc::Receiver<EncodedPayload>> {
        lock(&self.state).outbound.take()
    }

    /// Whether the session closed (or dropped) its transport handle.
    pub fn close_signalled(&self) -> bool {
        match lock(&self.state).shutdown.as_mut() {
            Some(shutdown) => !matches!(shutdown.try_recv(), Err(TryRecvError::Empty)),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, config: &LiveSessionConfig) -> SessionResult<TransportSession> {
        let gate = {
            let mut state = lock(&self.state);
            state.opens += 1;
            state.gate.clone()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let mut state = lock(&self.state);
        if let Some(reason) = &state.fail_with {
            return Err(SessionError::ConnectError(reason.clone()));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(config.send_queue_frames);
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        state.events = Some(events_tx);
        state.outbound = Some(outbound_rx);
        state.shutdown = Some(shutdown_rx);

        Ok(TransportSession {
            outbound: outbound_tx,
            events: events_rx,
            handle: TransportHandle::new(shutdown_tx),
        })
    }
}
