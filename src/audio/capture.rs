//! # Capture Pipeline
//!
//! Turns a live microphone stream into a sequence of outbound `EncodedPayload`s.
//!
//! ## Flow:
//! 1. **Acquire**: a `MicrophoneDevice` hands out a `MicrophoneStream` (chunks + track)
//! 2. **Assemble**: arbitrary-size chunks are sliced into fixed 4096-sample frames
//! 3. **Encode**: each frame becomes 16-bit PCM, base64, tagged `audio/pcm;rate=16000`
//! 4. **Send**: the payload is offered to the transport's bounded outbound queue
//!
//! ## Send policy:
//! Capture never waits on the transport. If the outbound queue is full the newest
//! frame is dropped and counted; if the transport is gone the frame is discarded.
//! Delivery is best-effort, exactly like a microphone feeding a network socket.

use crate::audio::frame::{AudioFrame, EncodedPayload};
use crate::error::{SessionError, SessionResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A source of microphone audio that must be acquired before use.
///
/// ## Errors:
/// Returns `CaptureUnavailable` when permission is denied or no device exists.
#[async_trait]
pub trait MicrophoneDevice: Send + Sync {
    async fn acquire(&self, sample_rate: u32) -> SessionResult<MicrophoneStream>;
}

/// Handle to an acquired microphone track.
///
/// `stop()` releases the device and must be safe to call more than once.
pub trait MicrophoneTrack: Send {
    fn stop(&mut self);
    fn is_live(&self) -> bool;
}

/// An acquired microphone: a stream of float sample chunks plus the track that owns the device.
pub struct MicrophoneStream {
    pub chunks: mpsc::Receiver<Vec<f32>>,
    pub track: Box<dyn MicrophoneTrack>,
}

/// Fixed format of outbound frames.
#[derive(Debug, Clone, Copy)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub frame_size: usize,
}

/// Slices a continuous sample stream into frames of exactly `frame_size` samples.
///
/// Samples that do not yet fill a frame are kept until the next chunk arrives.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(config: CaptureConfig) -> Self {
        let frame_size = config.frame_size.max(1);
        Self {
            frame_size,
            sample_rate: config.sample_rate,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Add a chunk and return every frame that is now complete, in order.
    pub fn push(&mut self, chunk: &[f32]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(chunk);

        let complete = self.pending.len() / self.frame_size;
        let mut frames = Vec::with_capacity(complete);
        for samples in self.pending.chunks_exact(self.frame_size) {
            frames.push(AudioFrame::from_float(samples, self.sample_rate));
        }
        self.pending.drain(..complete * self.frame_size);

        frames
    }

    /// Samples waiting for the next frame.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Counters shared between the capture task and whoever reports stats.
#[derive(Debug, Default)]
pub struct CaptureCounters {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl CaptureCounters {
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_dropped(&self) -> u64 {
        self.frames_dropped.load(Ordering::Relaxed)
    }
}

/// Entry point for starting capture.
pub struct CapturePipeline;

impl CapturePipeline {
    /// Start forwarding microphone chunks to `sink` as encoded frames.
    ///
    /// ## Parameters:
    /// - **chunks**: the acquired microphone stream
    /// - **sink**: the transport's outbound queue
    /// - **failures**: receives `CaptureUnavailable` if the microphone stream ends on its own
    ///
    /// Stopping the returned handle (or dropping it) ends capture without reporting a failure.
    pub fn start(
        mut chunks: mpsc::Receiver<Vec<f32>>,
        sink: mpsc::Sender<EncodedPayload>,
        config: CaptureConfig,
        counters: Arc<CaptureCounters>,
        failures: mpsc::UnboundedSender<SessionError>,
    ) -> CaptureHandle {
        let task = tokio::spawn(async move {
            let mut assembler = FrameAssembler::new(config);

            while let Some(chunk) = chunks.recv().await {
                for frame in assembler.push(&chunk) {
                    let payload = EncodedPayload::from_frame(&frame);
                    match sink.try_send(payload) {
                        Ok(()) => {
                            counters.frames_sent.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(_)) => {
                            let dropped = counters.frames_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                            // Log the first drop and then every 50th to keep noise down
                            if dropped == 1 || dropped % 50 == 0 {
                                warn!(dropped, samples = frame.sample_count(), "Outbound audio queue full, dropping capture frame");
                            }
                        }
                        Err(TrySendError::Closed(_)) => {
                            counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                            debug!("Transport outbound queue closed, discarding capture frame");
                        }
                    }
                }
            }

            debug!(pending = assembler.pending_len(), "Microphone stream ended");
            let _ = failures.send(SessionError::CaptureUnavailable(
                "microphone stream ended".to_string(),
            ));
        });

        CaptureHandle { task: Some(task) }
    }
}

/// Running capture task.
pub struct CaptureHandle {
    task: Option<JoinHandle<()>>,
}

impl CaptureHandle {
    /// Stop capture. Idempotent.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::codec;

    fn config(frame_size: usize) -> CaptureConfig {
        CaptureConfig {
            sample_rate: 16000,
            frame_size,
        }
    }

    #[test]
    fn test_assembler_emits_fixed_size_frames() {
        let mut assembler = FrameAssembler::new(config(4));

        assert!(assembler.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(assembler.pending_len(), 3);

        let frames = assembler.push(&[0.4, 0.5, 0.6, 0.7, 0.8, 0.9]);
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.sample_count() == 4 && f.sample_rate() == 16000));
        assert_eq!(assembler.pending_len(), 1);

        // Order is preserved across chunk boundaries
        assert_eq!(frames[0], AudioFrame::from_float(&[0.1, 0.2, 0.3, 0.4], 16000));
        assert_eq!(frames[1], AudioFrame::from_float(&[0.5, 0.6, 0.7, 0.8], 16000));
    }

    #[tokio::test]
    async fn test_pipeline_encodes_and_forwards_frames() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(8);
        let (fail_tx, _fail_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(CaptureCounters::default());

        let mut handle = CapturePipeline::start(chunk_rx, sink_tx, config(2), counters.clone(), fail_tx);

        chunk_tx.send(vec![0.5, -0.5, 0.25]).await.unwrap();
        let payload = sink_rx.recv().await.unwrap();

        assert_eq!(payload.mime_type, "audio/pcm;rate=16000");
        assert_eq!(payload.to_bytes().unwrap(), codec::encode_samples(&[0.5, -0.5]));
        assert_eq!(counters.frames_sent(), 1);

        handle.stop();
        handle.stop();
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_frames() {
        let (chunk_tx, chunk_rx) = mpsc::channel(8);
        let (sink_tx, mut sink_rx) = mpsc::channel(1);
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(CaptureCounters::default());

        let _handle = CapturePipeline::start(chunk_rx, sink_tx, config(1), counters.clone(), fail_tx);

        chunk_tx.send(vec![0.1, 0.2, 0.3]).await.unwrap();
        drop(chunk_tx);

        // Stream end is reported once all chunks are processed
        let failure = fail_rx.recv().await.unwrap();
        assert!(matches!(failure, SessionError::CaptureUnavailable(_)));

        assert_eq!(counters.frames_sent(), 1);
        assert_eq!(counters.frames_dropped(), 2);
        let first = sink_rx.recv().await.unwrap();
        assert_eq!(first.to_bytes().unwrap(), codec::encode_samples(&[0.1]));
    }

    #[tokio::test]
    async fn test_stopped_pipeline_does_not_report_failure() {
        let (_chunk_tx, chunk_rx) = mpsc::channel::<Vec<f32>>(8);
        let (sink_tx, _sink_rx) = mpsc::channel(8);
        let (fail_tx, mut fail_rx) = mpsc::unbounded_channel();

        let mut handle = CapturePipeline::start(
            chunk_rx,
            sink_tx,
            config(4),
            Arc::new(CaptureCounters::default()),
            fail_tx,
        );
        handle.stop();

        // The aborted task drops its sender without sending
        assert!(fail_rx.recv().await.is_none());
    }
}
