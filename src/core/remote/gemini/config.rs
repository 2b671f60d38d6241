//! Gemini Live API configuration types.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroize;

use crate::core::remote::base::{RemoteError, RemoteResult, RetryConfig, SendTimeouts};

/// Gemini Live BidiGenerateContent WebSocket endpoint.
pub const GEMINI_LIVE_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1alpha.GenerativeService.BidiGenerateContent";

/// Model used when none is configured.
pub const DEFAULT_GEMINI_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// MIME type of microphone audio sent to the model.
pub const AUDIO_INPUT_MIME_TYPE: &str = "audio/pcm;rate=16000";

// =============================================================================
// Voices
// =============================================================================

/// Prebuilt Gemini voices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GeminiVoice {
    #[default]
    Puck,
    Charon,
    Kore,
    Fenrir,
    Aoede,
    Zubenelgenubi,
    Orion,
    Pegasus,
    Vega,
    Algenib,
    Alkaid,
    Altair,
    Castor,
    Polaris,
}

impl GeminiVoice {
    pub const ALL: [GeminiVoice; 14] = [
        Self::Puck,
        Self::Charon,
        Self::Kore,
        Self::Fenrir,
        Self::Aoede,
        Self::Zubenelgenubi,
        Self::Orion,
        Self::Pegasus,
        Self::Vega,
        Self::Algenib,
        Self::Alkaid,
        Self::Altair,
        Self::Castor,
        Self::Polaris,
    ];

    /// Convert to the API parameter value.
    #[inline]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Aoede => "Aoede",
            Self::Zubenelgenubi => "Zubenelgenubi",
            Self::Orion => "Orion",
            Self::Pegasus => "Pegasus",
            Self::Vega => "Vega",
            Self::Algenib => "Algenib",
            Self::Alkaid => "Alkaid",
            Self::Altair => "Altair",
            Self::Castor => "Castor",
            Self::Polaris => "Polaris",
        }
    }

    /// Parse a voice name. Names are case sensitive, as the API expects.
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|v| v.as_str() == name)
    }

    /// Comma separated list of every supported name.
    pub fn supported_names() -> String {
        Self::ALL
            .iter()
            .map(|v| v.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Display for GeminiVoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Settings for one Gemini Live connection.
#[derive(Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// API key, sent as the `key` query parameter
    pub api_key: String,
    /// Model name; `models/` is prepended when missing
    pub model: String,
    pub voice: GeminiVoice,
    pub system_instruction: Option<String>,
    /// Text turn sent right after setup to warm up the model's context
    pub preload_context: Option<String>,
    pub affective_dialog: bool,
    /// Endpoint without query string
    pub url: String,
    pub retry: RetryConfig,
    /// How long to wait for `setupComplete` before proceeding anyway
    pub setup_timeout: Duration,
    /// How long to wait for the acknowledgment of the preload turn
    pub preload_timeout: Duration,
    pub send_timeouts: SendTimeouts,
    /// Capacity of the outbound and inbound channels
    pub channel_capacity: usize,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_GEMINI_MODEL.to_string(),
            voice: GeminiVoice::default(),
            system_instruction: None,
            preload_context: None,
            affective_dialog: false,
            url: GEMINI_LIVE_URL.to_string(),
            retry: RetryConfig::default(),
            setup_timeout: Duration::from_secs(10),
            preload_timeout: Duration::from_secs(10),
            send_timeouts: SendTimeouts::default(),
            channel_capacity: 256,
        }
    }

    /// Model name in the `models/<name>` form the API expects.
    pub fn model_path(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    /// Full WebSocket URL including the key.
    pub fn ws_url(&self) -> RemoteResult<url::Url> {
        let mut url = url::Url::parse(&self.url)
            .map_err(|e| RemoteError::InvalidConfiguration(format!("invalid url: {e}")))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }

    pub fn validate(&self) -> RemoteResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(RemoteError::InvalidConfiguration(
                "API key is required".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(RemoteError::InvalidConfiguration(
                "model is required".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(RemoteError::InvalidConfiguration(
                "channel_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &mask_api_key(&self.api_key))
            .field("model", &self.model)
            .field("voice", &self.voice)
            .field("affective_dialog", &self.affective_dialog)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl Drop for GeminiConfig {
    fn drop(&mut self) {
        self.api_key.zeroize();
    }
}

/// Mask an API key for logging: first 6 and last 4 characters.
pub fn mask_api_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 12 {
        return "[REDACTED]".to_string();
    }
    let head: String = chars[..6].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
