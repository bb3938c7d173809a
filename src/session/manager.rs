//! # Session Registry
//!
//! Tracks every live voice session on this server and enforces the concurrent
//! session limit. Each browser connection owns at most one session at a time.
//!
//! ## Thread Safety:
//! Uses `RwLock` so listing sessions (health, metrics, `GET /api/v1/sessions`) can
//! run concurrently while creation and removal take the write lock briefly.

use crate::error::{AppError, AppResult};
use crate::session::controller::{SessionConfig, SessionController, SessionDevices, SessionStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

struct Entry {
    controller: Arc<SessionController>,
    created_at: DateTime<Utc>,
}

/// One row of `GET /api/v1/sessions`.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub state: String,
    pub listening: bool,
    pub created_at: DateTime<Utc>,
    pub age_seconds: f64,
    pub stats: SessionStats,
}

/// Registry of live voice sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Entry>>,
    max_concurrent_sessions: AtomicUsize,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
        }
    }

    /// Apply a new session limit. Existing sessions are never evicted.
    pub fn set_max_concurrent_sessions(&self, limit: usize) {
        self.max_concurrent_sessions.store(limit, Ordering::Relaxed);
    }

    pub fn max_concurrent_sessions(&self) -> usize {
        self.max_concurrent_sessions.load(Ordering::Relaxed)
    }

    /// Register a new session controller (not started yet).
    ///
    /// ## Parameters:
    /// - **session_id**: Optional session ID. If None, a UUID is generated
    ///
    /// ## Errors:
    /// - `SessionLimit` when the server is full
    /// - `BadRequest` when the ID is empty or already in use
    pub fn create_session(
        &self,
        session_id: Option<String>,
        config: SessionConfig,
        devices: SessionDevices,
    ) -> AppResult<Arc<SessionController>> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());

        let limit = self.max_concurrent_sessions();
        if sessions.len() >= limit {
            return Err(AppError::SessionLimit(format!(
                "Maximum concurrent sessions ({}) reached",
                limit
            )));
        }

        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if session_id.trim().is_empty() {
            return Err(AppError::BadRequest("Session ID must not be empty".to_string()));
        }
        if sessions.contains_key(&session_id) {
            return Err(AppError::BadRequest(format!("Session ID '{}' already exists", session_id)));
        }

        let controller = Arc::new(SessionController::new(session_id.clone(), config, devices));
        sessions.insert(
            session_id.clone(),
            Entry {
                controller: controller.clone(),
                created_at: Utc::now(),
            },
        );
        info!(session_id = %session_id, active = sessions.len(), "Voice session registered");

        Ok(controller)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<SessionController>> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.get(session_id).map(|entry| entry.controller.clone())
    }

    /// Stop and unregister a session by id. Returns the controller if this call removed it.
    pub fn remove_session(&self, session_id: &str) -> Option<Arc<SessionController>> {
        self.take(session_id, |_| true)
    }

    /// Stop and unregister `controller`, but only if it is still the one registered under its id.
    pub fn remove_controller(&self, controller: &Arc<SessionController>) -> bool {
        self.take(controller.id(), |entry| Arc::ptr_eq(&entry.controller, controller))
            .is_some()
    }

    fn take<F>(&self, session_id: &str, matches: F) -> Option<Arc<SessionController>>
    where
        F: FnOnce(&Entry) -> bool,
    {
        let entry = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            if sessions.get(session_id).is_some_and(matches) {
                sessions.remove(session_id)
            } else {
                None
            }
        }?;

        entry.controller.stop();
        debug!(session_id = %session_id, "Voice session unregistered");
        Some(entry.controller)
    }

    /// Stop every session (used at shutdown).
    pub fn stop_all(&self) -> usize {
        let drained: Vec<Entry> = {
            let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
            sessions.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.controller.stop();
        }
        drained.len()
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Sessions currently in the `Active` state.
    pub fn listening_count(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        sessions.values().filter(|entry| entry.controller.is_listening()).count()
    }

    pub fn summaries(&self) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let mut summaries: Vec<SessionSummary> = sessions
            .iter()
            .map(|(id, entry)| {
                let stats = entry.controller.stats();
                SessionSummary {
                    session_id: id.clone(),
                    state: stats.state.to_string(),
                    listening: entry.controller.is_listening(),
                    created_at: entry.created_at,
                    age_seconds: now.signed_duration_since(entry.created_at).num_milliseconds() as f64 / 1000.0,
                    stats,
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        summaries
    }
}
