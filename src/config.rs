//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Special environment variables (HOST, PORT, GEMINI_API_KEY, API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_LIVE__VOICE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, live endpoint, audio format,
/// performance) keeps each concern easy to find and validate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Live conversational endpoint settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional generate-content service
/// - `api_key`: API key appended to the endpoint URL (never echoed back by the API)
/// - `model`: Model identifier used in the setup message
/// - `voice`: Prebuilt voice used for synthesized replies
/// - `system_instruction`: Instruction text sent once at session setup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

/// Audio format settings for both directions of a voice session.
///
/// ## Fixed formats:
/// - Capture (microphone → endpoint): 16 kHz mono, 4096-sample frames
/// - Playback (endpoint → speaker): 24 kHz mono
///
/// `send_queue_frames` bounds how many encoded frames may wait for the transport
/// before new frames are dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub playback_sample_rate: u32,
    pub playback_channels: u16,
    pub frame_size: usize,
    pub send_queue_frames: usize,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Each voice session holds one upstream WebSocket and one browser WebSocket
/// - The client timeout must be longer than the heartbeat interval
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            live: LiveConfig {
                endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
                api_key: String::new(),
                model: "gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
                voice: "Zephyr".to_string(),
                system_instruction: "You are EduScope AI tutor.".to_string(),
            },
            audio: AudioConfig {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                playback_channels: 1,
                frame_size: 4096,
                send_queue_frames: 32,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 30,
                client_timeout_secs: 60,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_
    /// 4. Handle special cases for HOST, PORT and the API key
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_LIVE__VOICE=Puck`: Override the reply voice
    /// - `APP_AUDIO__SEND_QUEUE_FRAMES=64`: Allow a deeper outbound queue
    /// - `GEMINI_API_KEY=...` or `API_KEY=...`: API key for the live endpoint
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates nesting so field names keep their own underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")) {
            settings = settings.set_override("live.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - Live endpoint is a ws:// or wss:// URL and the model/voice are set
    /// - Both sample rates, the channel count, frame size and send queue are non-zero
    /// - At least one concurrent session is allowed
    /// - Client timeout is longer than the heartbeat interval
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if !(self.live.endpoint.starts_with("wss://") || self.live.endpoint.starts_with("ws://")) {
            return Err(anyhow::anyhow!("Live endpoint must be a ws:// or wss:// URL"));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model must not be empty"));
        }

        if self.live.voice.trim().is_empty() {
            return Err(anyhow::anyhow!("Live voice must not be empty"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.playback_channels == 0 {
            return Err(anyhow::anyhow!("Playback channels must be greater than 0"));
        }

        if self.audio.frame_size == 0 {
            return Err(anyhow::anyhow!("Capture frame size must be greater than 0"));
        }

        if self.audio.send_queue_frames == 0 {
            return Err(anyhow::anyhow!("Send queue must hold at least one frame"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.performance.client_timeout_secs <= self.performance.heartbeat_interval_secs {
            return Err(anyhow::anyhow!(
                "Client timeout ({}s) must be longer than the heartbeat interval ({}s)",
                self.performance.client_timeout_secs,
                self.performance.heartbeat_interval_secs
            ));
        }

        Ok(())
    }

    /// Whether an API key has been configured for the live endpoint.
    pub fn has_api_key(&self) -> bool {
        !self.live.api_key.trim().is_empty()
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are changed. For example
    /// `{"live": {"voice": "Puck"}}` changes only the reply voice.
    /// The API key cannot be changed through this path.
    ///
    /// Changes apply to sessions started after the update; running sessions keep
    /// the settings they started with.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Port {} is out of range", port))?;
            }
        }

        if let Some(live) = partial_config.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                self.live.endpoint = endpoint.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice").and_then(|v| v.as_str()) {
                self.live.voice = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(frame_size) = audio.get("frame_size").and_then(|v| v.as_u64()) {
                self.audio.frame_size = frame_size as usize;
            }
            if let Some(queue) = audio.get("send_queue_frames").and_then(|v| v.as_u64()) {
                self.audio.send_queue_frames = queue as usize;
            }
        }

        if let Some(performance) = partial_config.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(interval) = performance.get("heartbeat_interval_secs").and_then(|v| v.as_u64()) {
                self.performance.heartbeat_interval_secs = interval;
            }
            if let Some(timeout) = performance.get("client_timeout_secs").and_then(|v| v.as_u64()) {
                self.performance.client_timeout_secs = timeout;
            }
        }

        self.validate()?;
        Ok(())
    }
}
