//! # Application State Management
//!
//! Shared state handed to every HTTP handler and every voice WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers and actors share ownership of the same data
//! - **Memory safety**: The data is freed when the last reference is dropped
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Allows multiple readers OR one writer at a time
//! - **Why needed**: Many requests read config and metrics, few update them
//!
//! ### Trait objects (`Arc<dyn Transport>`)
//! - The live transport is chosen once at startup and shared by all sessions
//! - Tests can swap in an in-memory transport without touching the handlers

use crate::config::AppConfig;
use crate::live::transport::Transport;
use crate::session::controller::{SessionController, SessionStats};
use crate::session::manager::SessionManager;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request and streaming metrics
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Live voice sessions
    pub sessions: Arc<SessionManager>,

    /// Connects new sessions to the live endpoint
    pub transport: Arc<dyn Transport>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests and voice sessions.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Voice WebSocket connections currently open
    pub active_connections: u32,

    /// Per-endpoint statistics, keyed by "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,

    /// Counters folded in from finished voice sessions
    pub streaming: StreamingMetrics,
}

/// Detailed performance metrics for a specific API endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

/// Aggregate counters of the streaming core.
///
/// Finished sessions are folded in when they are retired from the registry; the metrics endpoint
/// adds the live sessions on top so nothing is counted twice.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize)]
pub struct StreamingMetrics {
    pub sessions_started: u64,
    pub sessions_failed: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub fragments_scheduled: u64,
    pub fragments_dropped: u64,
    pub teardowns: u64,
}

impl StreamingMetrics {
    /// Add one session's counters.
    pub fn absorb(&mut self, stats: &SessionStats) {
        self.frames_sent += stats.frames_sent;
        self.frames_dropped += stats.frames_dropped;
        self.fragments_scheduled += stats.fragments_scheduled;
        self.fragments_dropped += stats.fragments_dropped;
        self.teardowns += stats.teardowns;
    }
}

impl AppState {
    /// Create a new AppState with the given configuration and live transport.
    pub fn new(config: AppConfig, transport: Arc<dyn Transport>) -> Self {
        let sessions = Arc::new(SessionManager::new(config.performance.max_concurrent_sessions));
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions,
            transport,
            start_time: Instant::now(),
        }
    }

    fn read_metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_metrics(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Validate and install a new configuration.
    ///
    /// The session limit takes effect immediately; audio and live settings apply
    /// to sessions started afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.sessions
            .set_max_concurrent_sessions(new_config.performance.max_concurrent_sessions);
        *self.config.write().unwrap_or_else(|e| e.into_inner()) = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.write_metrics().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.write_metrics().error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.write_metrics();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// A voice WebSocket connection opened.
    pub fn increment_active_connections(&self) {
        self.write_metrics().active_connections += 1;
    }

    /// A voice WebSocket connection closed. Never goes below zero.
    pub fn decrement_active_connections(&self) {
        let mut metrics = self.write_metrics();
        metrics.active_connections = metrics.active_connections.saturating_sub(1);
    }

    /// A session `start()` returned; `failed` when it returned an error other than cancellation.
    pub fn record_session_start(&self, failed: bool) {
        let mut metrics = self.write_metrics();
        metrics.streaming.sessions_started += 1;
        if failed {
            metrics.streaming.sessions_failed += 1;
        }
    }

    /// Stop and unregister a session by id, folding its final counters into the totals.
    ///
    /// Stats are recorded only by the call that actually removes the session, so a session
    /// stopped over HTTP and later cleaned up by its connection is counted once.
    pub fn retire_session(&self, session_id: &str) -> Option<Arc<SessionController>> {
        let controller = self.sessions.remove_session(session_id)?;
        self.record_session_stats(&controller.stats());
        Some(controller)
    }

    /// Like `retire_session`, but only if `controller` is still the registered session.
    pub fn retire_controller(&self, controller: &Arc<SessionController>) -> bool {
        if !self.sessions.remove_controller(controller) {
            return false;
        }
        self.record_session_stats(&controller.stats());
        true
    }

    fn record_session_stats(&self, stats: &SessionStats) {
        self.write_metrics().streaming.absorb(stats);
    }

    /// Finished-session totals plus every live session's current counters.
    pub fn streaming_totals(&self) -> StreamingMetrics {
        let mut totals = self.read_metrics().streaming;
        for summary in self.sessions.summaries() {
            totals.absorb(&summary.stats);
        }
        totals
    }

    /// Snapshot of the current metrics, so no lock is held while serializing.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.read_metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds (0.0 before the first request).
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, from 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::controller::{SessionConfig, SessionDevices, SessionState};
    use crate::testing::{ScriptedMicrophone, ScriptedTransport, VirtualOutputDevice};

    fn state() -> AppState {
        AppState::new(AppConfig::default(), Arc::new(ScriptedTransport::new()))
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }

    #[test]
    fn test_active_connections_never_underflow() {
        let state = state();
        state.decrement_active_connections();
        state.increment_active_connections();
        state.increment_active_connections();
        state.decrement_active_connections();
        assert_eq!(state.get_metrics_snapshot().active_connections, 1);
    }

    #[test]
    fn test_update_config_applies_session_limit() {
        let state = state();
        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 3;
        state.update_config(config).unwrap();
        assert_eq!(state.sessions.max_concurrent_sessions(), 3);

        let mut invalid = state.get_config();
        invalid.audio.frame_size = 0;
        assert!(state.update_config(invalid).is_err());
        assert_eq!(state.get_config().audio.frame_size, 4096);
    }

    #[test]
    fn test_streaming_totals_accumulate() {
        let state = state();
        state.record_session_start(false);
        state.record_session_start(true);

        let snapshot = state.get_metrics_snapshot().streaming;
        assert_eq!(snapshot.sessions_started, 2);
        assert_eq!(snapshot.sessions_failed, 1);
        assert_eq!(state.streaming_totals().teardowns, 0);
    }

    #[tokio::test]
    async fn test_session_stats_are_recorded_once() {
        let state = state();
        let controller = state
            .sessions
            .create_session(
                Some("lesson-1".into()),
                SessionConfig::from_app_config(&AppConfig::default()),
                SessionDevices {
                    microphone: Arc::new(ScriptedMicrophone::granted()),
                    output: Arc::new(VirtualOutputDevice::new()),
                    transport: Arc::new(ScriptedTransport::new()),
                },
            )
            .unwrap();
        controller.start().await.unwrap();

        // Stopped over HTTP first, then the owning connection cleans up
        assert!(state.retire_session("lesson-1").is_some());
        assert_eq!(controller.state(), SessionState::Closed);
        assert!(!state.retire_controller(&controller));
        assert!(state.retire_session("lesson-1").is_none());

        let totals = state.streaming_totals();
        assert_eq!(totals.teardowns, 1);
        assert_eq!(state.get_metrics_snapshot().streaming.teardowns, 1);
    }
}
