//! Gemini Live WebSocket message types.
//!
//! # Protocol Overview
//!
//! Client messages (sent to server):
//! - setup - Model, voice and system instruction, first message on the socket
//! - realtimeInput - Streaming audio, video frames, audioStreamEnd
//! - clientContent - Complete conversation turns (text)
//! - toolResponse - Function call results
//!
//! Server messages (received from server):
//! - setupComplete - Setup acknowledged
//! - serverContent - Model turn parts, turnComplete, interrupted
//! - toolCall - Function calls requested by the model
//! - usageMetadata - Token accounting
//! - goAway - The server will disconnect soon

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::{AUDIO_INPUT_MIME_TYPE, GeminiConfig};
use crate::core::codec::is_wire_safe_base64;
use crate::core::remote::base::{RemoteError, RemoteEvent, RemoteInput, RemoteResult};

// =============================================================================
// Client Messages
// =============================================================================

/// Top-level client message. Serializes as `{"<variant>": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
    ClientContent(ClientContent),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    pub fn to_json(&self) -> RemoteResult<String> {
        serde_json::to_string(self).map_err(|e| RemoteError::SerializationError(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_affective_dialog: Option<bool>,
}

impl Setup {
    pub fn from_config(config: &GeminiConfig) -> Self {
        Self {
            model: config.model_path(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice.as_str().to_string(),
                        },
                    },
                },
            },
            system_instruction: config
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|text| Content {
                    role: None,
                    parts: vec![Part::text(text.clone())],
                }),
            enable_affective_dialog: config.affective_dialog.then_some(true),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

/// A conversation turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

/// One part of a turn: text or inline binary data.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            inline_data: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    #[serde(default)]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_stream_end: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

impl ClientContent {
    /// A complete user text turn.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            turns: vec![Content {
                role: Some("user".to_string()),
                parts: vec![Part::text(text)],
            }],
            turn_complete: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Value,
}

impl ToolResponse {
    /// Accepts a list of responses, a single response, or an object already
    /// holding `functionResponses`.
    pub fn from_value(value: Value) -> Self {
        let function_responses = match value {
            Value::Object(mut map) if map.contains_key("functionResponses") => map
                .remove("functionResponses")
                .unwrap_or(Value::Array(Vec::new())),
            Value::Array(items) => Value::Array(items),
            other => Value::Array(vec![other]),
        };
        Self { function_responses }
    }
}

/// Build the `realtimeInput.audio` message for a base64 PCM payload.
///
/// Wire-safe payloads are spliced into a fixed template; anything else goes
/// through the serializer.
pub fn realtime_audio_message(payload: &str) -> RemoteResult<String> {
    if is_wire_safe_base64(payload) {
        let mut json = String::with_capacity(payload.len() + 80);
        json.push_str(r#"{"realtimeInput":{"audio":{"mimeType":""#);
        json.push_str(AUDIO_INPUT_MIME_TYPE);
        json.push_str(r#"","data":""#);
        json.push_str(payload);
        json.push_str(r#""}}}"#);
        return Ok(json);
    }

    ClientMessage::RealtimeInput(RealtimeInput {
        audio: Some(Blob {
            mime_type: AUDIO_INPUT_MIME_TYPE.to_string(),
            data: payload.to_string(),
        }),
        ..Default::default()
    })
    .to_json()
}

/// Wire form of an outbound input. `Interrupt` has no wire form and
/// yields `None`.
pub fn encode_input(input: &RemoteInput) -> RemoteResult<Option<String>> {
    let message = match input {
        RemoteInput::Audio(payload) => return realtime_audio_message(payload).map(Some),
        RemoteInput::Interrupt => return Ok(None),
        RemoteInput::Text(text) => ClientMessage::ClientContent(ClientContent::user_text(text.clone())),
        RemoteInput::Image { data, mime_type } => ClientMessage::RealtimeInput(RealtimeInput {
            video: Some(Blob {
                mime_type: mime_type.clone(),
                data: data.clone(),
            }),
            ..Default::default()
        }),
        RemoteInput::EndOfTurn => ClientMessage::RealtimeInput(RealtimeInput {
            audio_stream_end: Some(true),
            ..Default::default()
        }),
        RemoteInput::ToolResponse(value) => {
            ClientMessage::ToolResponse(ToolResponse::from_value(value.clone()))
        }
    };
    message.to_json().map(Some)
}

// =============================================================================
// Server Messages
// =============================================================================

/// A server message. Several fields may be present at once.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub tool_call: Option<Value>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn parse(json: &str) -> RemoteResult<Self> {
        serde_json::from_str(json).map_err(|e| RemoteError::SerializationError(e.to_string()))
    }

    /// Flatten into channel events, in wire order.
    pub fn into_events(self) -> Vec<RemoteEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(RemoteEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if content.interrupted {
                events.push(RemoteEvent::Interrupted);
            }
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    if let Some(blob) = part.inline_data
                        && (blob.mime_type.is_empty() || blob.mime_type.starts_with("audio/"))
                        && !blob.data.is_empty()
                    {
                        events.push(RemoteEvent::Audio(blob.data));
                    }
                    if let Some(text) = part.text
                        && !text.is_empty()
                    {
                        events.push(RemoteEvent::Text(text));
                    }
                }
            }
            if content.turn_complete {
                events.push(RemoteEvent::TurnComplete);
            }
        }

        if let Some(call) = self.tool_call {
            events.push(RemoteEvent::ToolCall(call));
        }

        if let Some(usage) = self.usage_metadata {
            events.push(RemoteEvent::Usage {
                total_tokens: usage.total_token_count,
            });
        }

        if let Some(go_away) = self.go_away {
            events.push(RemoteEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}
