//! # Playback Scheduler
//!
//! Renders inbound response fragments as gapless audio on an output device.
//!
//! ## Algorithm:
//! For every fragment:
//! 1. Decode the PCM payload at the fixed playback format (24 kHz mono)
//! 2. `start_at = max(clock.next, device.now)`
//! 3. Schedule the buffer on the device at `start_at`
//! 4. `clock.next = start_at + duration`
//! 5. Track the unit in the in-flight set until the device reports it finished
//!
//! ## Ordering guarantees:
//! Units play in receipt order and never overlap. Unit *k+1* starts exactly when
//! unit *k* ends unless the device clock has already passed that point (underrun),
//! in which case it starts immediately: a gap is allowed, an overlap is not.

use crate::audio::codec::{self, FloatBuffer};
use crate::audio::frame::EncodedPayload;
use crate::error::{SessionError, SessionResult};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An opened output device plus the channel on which it reports finished units.
pub struct OutputContext {
    pub output: Box<dyn AudioOutput>,
    pub completions: mpsc::UnboundedReceiver<u64>,
}

/// Something that can open an output context at a given format.
pub trait OutputDevice: Send + Sync {
    fn open(&self, sample_rate: u32, channels: u16) -> SessionResult<OutputContext>;
}

/// An open output device.
///
/// ## Contract:
/// - `current_time()` is monotonic, in seconds
/// - `schedule()` accepts start times in the future (or now)
/// - a unit that plays to the end is reported once on the completions channel
/// - `stop()` on an unknown or finished unit is a no-op
/// - `close()` is idempotent
pub trait AudioOutput: Send {
    fn current_time(&self) -> f64;
    fn schedule(&mut self, unit_id: u64, buffer: &FloatBuffer, start_at: f64) -> SessionResult<()>;
    fn stop(&mut self, unit_id: u64);
    fn close(&mut self);
}

/// End of the last scheduled unit on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutputClock {
    next: f64,
}

impl OutputClock {
    pub fn starting_at(time: f64) -> Self {
        Self { next: time }
    }

    pub fn next(&self) -> f64 {
        self.next
    }

    /// Start time for a unit given the device's current time.
    pub fn start_for(&self, now: f64) -> f64 {
        self.next.max(now)
    }

    /// Reserve `[start_for(now), start_for(now) + duration)` and return its start.
    pub fn place(&mut self, now: f64, duration: f64) -> f64 {
        let start = self.start_for(now);
        self.next = start + duration;
        start
    }

    /// Move the cursor back to `time` (used when a turn is interrupted).
    pub fn reset(&mut self, time: f64) {
        self.next = time;
    }
}

/// A decoded fragment placed on the output timeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackUnit {
    pub id: u64,
    pub start_at: f64,
    pub duration: f64,
    pub frames: usize,
}

impl PlaybackUnit {
    pub fn end_at(&self) -> f64 {
        self.start_at + self.duration
    }
}

/// Owns the output device, the output clock and the in-flight set for one session.
pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    clock: OutputClock,
    in_flight: BTreeMap<u64, PlaybackUnit>,
    next_unit_id: u64,
    sample_rate: u32,
    channels: u16,
    closed: bool,
}

impl PlaybackScheduler {
    /// Create a scheduler whose clock starts at the device's current time.
    pub fn new(output: Box<dyn AudioOutput>, sample_rate: u32, channels: u16) -> Self {
        let clock = OutputClock::starting_at(output.current_time());
        Self {
            output,
            clock,
            in_flight: BTreeMap::new(),
            next_unit_id: 1,
            sample_rate,
            channels,
            closed: false,
        }
    }

    /// Decode and schedule one inbound fragment.
    ///
    /// ## Errors:
    /// - `DecodeError`: the fragment is dropped; clock and in-flight set are unchanged
    /// - anything the output device returns from `schedule()`
    pub fn schedule_fragment(&mut self, payload: &EncodedPayload) -> SessionResult<PlaybackUnit> {
        if self.closed {
            return Err(SessionError::InvalidState("playback output is closed".to_string()));
        }

        let buffer = self.decode(payload)?;

        let duration = buffer.duration();
        let now = self.output.current_time();
        let start_at = self.clock.start_for(now);
        let id = self.next_unit_id;

        // Clock only advances once the device has accepted the unit
        self.output.schedule(id, &buffer, start_at)?;
        self.clock.place(now, duration);
        self.next_unit_id += 1;

        let unit = PlaybackUnit {
            id,
            start_at,
            duration,
            frames: buffer.frames(),
        };
        debug!(unit_id = id, start_at, duration, "Scheduled playback unit");
        self.in_flight.insert(id, unit.clone());
        Ok(unit)
    }

    fn decode(&self, payload: &EncodedPayload) -> SessionResult<FloatBuffer> {
        if !payload.is_pcm_audio() {
            return Err(SessionError::DecodeError(format!(
                "unsupported fragment type '{}'",
                payload.mime_type
            )));
        }
        if let Some(rate) = payload.sample_rate() {
            if rate != self.sample_rate {
                warn!(
                    declared = rate,
                    expected = self.sample_rate,
                    "Fragment sample rate differs from playback rate, playing at playback rate"
                );
            }
        }

        let bytes = payload.to_bytes()?;
        codec::decode_to_float_buffer(&bytes, self.sample_rate, self.channels)
    }

    /// A unit played to its natural end.
    pub fn on_ended(&mut self, unit_id: u64) -> bool {
        self.in_flight.remove(&unit_id).is_some()
    }

    /// Force-stop every in-flight unit and clear the set. Returns how many were stopped.
    pub fn stop_all(&mut self) -> usize {
        let stopped = self.in_flight.len();
        for id in self.in_flight.keys() {
            self.output.stop(*id);
        }
        self.in_flight.clear();
        stopped
    }

    /// Drop the rest of the current turn: stop everything and pull the clock back to now.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.stop_all();
        let now = self.output.current_time();
        self.clock.reset(now);
        stopped
    }

    /// Stop all units and close the device. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.stop_all();
        self.output.close();
        self.closed = true;
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn clock(&self) -> OutputClock {
        self.clock
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pcm_fragment, VirtualOutputDevice};

    fn scheduler(device: &VirtualOutputDevice) -> PlaybackScheduler {
        let context = device.open(24000, 1).unwrap();
        PlaybackScheduler::new(context.output, 24000, 1)
    }

    #[test]
    fn test_clock_place_never_overlaps() {
        let mut clock = OutputClock::starting_at(0.0);
        assert_eq!(clock.place(0.0, 0.5), 0.0);
        assert_eq!(clock.place(0.1, 0.5), 0.5);
        // Underrun: device already at 2.0, next unit starts immediately
        assert_eq!(clock.place(2.0, 0.25), 2.0);
        assert_eq!(clock.next(), 2.25);
    }

    #[test]
    fn test_units_are_gapless_without_underrun() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);
        let durations = [0.5, 0.25, 1.0, 0.125];

        let units: Vec<PlaybackUnit> = durations
            .iter()
            .map(|d| scheduler.schedule_fragment(&pcm_fragment(*d, 24000)).unwrap())
            .collect();

        for pair in units.windows(2) {
            assert_eq!(pair[1].start_at, pair[0].end_at());
        }
        assert_eq!(units[0].start_at, 0.0);
        assert_eq!(scheduler.clock().next(), 1.875);
        assert_eq!(scheduler.in_flight_count(), 4);
        assert_eq!(device.scheduled_starts(), vec![0.0, 0.5, 0.75, 1.75]);
    }

    #[test]
    fn test_underrun_starts_at_device_time() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);

        let first = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();
        device.set_time(3.0);
        let second = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();

        assert_eq!(first.start_at, 0.0);
        assert_eq!(second.start_at, 3.0);
        assert!(second.start_at >= first.end_at());
    }

    #[test]
    fn test_decode_error_leaves_clock_and_set_untouched() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);
        scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();
        let clock_before = scheduler.clock();

        let odd = EncodedPayload::new(codec::bytes_to_text(&[1, 2, 3]), "audio/pcm;rate=24000".into());
        assert!(matches!(scheduler.schedule_fragment(&odd), Err(SessionError::DecodeError(_))));

        let garbage = EncodedPayload::new("%%%".into(), "audio/pcm;rate=24000".into());
        assert!(matches!(scheduler.schedule_fragment(&garbage), Err(SessionError::DecodeError(_))));

        assert_eq!(scheduler.clock(), clock_before);
        assert_eq!(scheduler.in_flight_count(), 1);
        assert_eq!(device.scheduled().len(), 1);
    }

    #[test]
    fn test_natural_completion_and_forced_stop() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);
        let a = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();
        let b = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();
        let c = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();

        assert!(scheduler.on_ended(a.id));
        assert!(!scheduler.on_ended(a.id));

        assert_eq!(scheduler.stop_all(), 2);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert_eq!(device.stopped(), vec![b.id, c.id]);
    }

    #[test]
    fn test_interrupt_resets_clock_to_now() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);
        scheduler.schedule_fragment(&pcm_fragment(1.0, 24000)).unwrap();
        scheduler.schedule_fragment(&pcm_fragment(1.0, 24000)).unwrap();

        device.set_time(0.4);
        assert_eq!(scheduler.interrupt(), 2);
        let next = scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();
        assert_eq!(next.start_at, 0.4);
    }

    #[test]
    fn test_close_is_idempotent_and_rejects_new_fragments() {
        let device = VirtualOutputDevice::new();
        let mut scheduler = scheduler(&device);
        scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).unwrap();

        scheduler.close();
        scheduler.close();

        assert_eq!(device.close_calls(), 1);
        assert_eq!(scheduler.in_flight_count(), 0);
        assert!(scheduler.schedule_fragment(&pcm_fragment(0.5, 24000)).is_err());
    }
}
