//! # Voice Session Module
//!
//! The session controller state machine and the registry of live sessions.

pub mod controller;
pub mod manager;

pub use controller::{SessionConfig, SessionController, SessionDevices, SessionState, SessionStats};
pub use manager::{SessionManager, SessionSummary};
