//! # Live Endpoint Wire Protocol
//!
//! JSON messages exchanged with the Gemini Live `BidiGenerateContent` endpoint.
//!
//! ## Client → server:
//! - `{"setup": {...}}` once, right after connecting
//! - `{"realtimeInput": {"mediaChunks": [{"mimeType": ..., "data": ...}]}}` per capture frame
//!
//! ## Server → client:
//! - `{"setupComplete": {}}`: the session is ready
//! - `{"serverContent": {"modelTurn": {"parts": [...]}, "turnComplete": bool, "interrupted": bool}}`
//! - `{"serverContent": {"outputTranscription": {"text": ...}}}`: transcript of the spoken reply
//! - `{"goAway": {"timeLeft": "..."}}`: the server will close soon

use crate::audio::frame::EncodedPayload;
use crate::live::transport::{LiveSessionConfig, TransportEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    /// Ask for transcripts of the spoken reply (`serverContent.outputTranscription`)
    pub output_audio_transcription: AudioTranscriptionConfig,
}

/// Serializes as `{}`: transcription with default settings.
#[derive(Debug, Default, Serialize)]
pub struct AudioTranscriptionConfig {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    /// Audio-only responses in the configured voice, with the system instruction attached.
    pub fn from_config(config: &LiveSessionConfig) -> Self {
        Self {
            setup: Setup {
                model: config.model_path(),
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: config.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: config.system_instruction.clone(),
                    }],
                },
                output_audio_transcription: AudioTranscriptionConfig::default(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedPayload>,
}

impl RealtimeInputMessage {
    pub fn single(payload: EncodedPayload) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![payload],
            },
        }
    }
}

/// Any message the server may send. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<serde_json::Value>,
    pub server_content: Option<ServerContent>,
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
    pub output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerPart {
    pub text: Option<String>,
    pub inline_data: Option<EncodedPayload>,
}

#[derive(Debug, Default, Deserialize)]
pub struct Transcription {
    pub text: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    /// Map one server message to transport events, in the order they should be handled.
    ///
    /// ## Mapping:
    /// - `setupComplete` → `Opened`
    /// - `interrupted` → `Interrupted` (before any parts in the same message)
    /// - each audio `inlineData` part → one `Fragment`; the last one is final if the turn completed
    /// - text parts and output transcripts → `Text`
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(TransportEvent::Opened);
        }

        let Some(content) = self.server_content else {
            return events;
        };

        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }

        let parts = content.model_turn.map(|turn| turn.parts).unwrap_or_default();
        let last_audio = parts.iter().rposition(|part| {
            part.inline_data
                .as_ref()
                .is_some_and(|data| data.mime_type.starts_with("audio/"))
        });

        for (index, part) in parts.into_iter().enumerate() {
            if let Some(text) = part.text.filter(|t| !t.trim().is_empty()) {
                events.push(TransportEvent::Text { text });
            }
            if let Some(payload) = part.inline_data {
                if payload.mime_type.starts_with("audio/") {
                    let is_final = content.turn_complete && Some(index) == last_audio;
                    events.push(TransportEvent::Fragment { payload, is_final });
                }
            }
        }

        if let Some(text) = content
            .output_transcription
            .and_then(|t| t.text)
            .filter(|t| !t.trim().is_empty())
        {
            events.push(TransportEvent::Text { text });
        }

        events
    }
}
