//! Remote speech-to-speech model channel.

pub mod base;
pub mod gemini;

pub use base::{
    BoxedRemote, ErrorCategory, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE, RemoteChannel,
    RemoteConnector, RemoteError, RemoteEvent, RemoteInput, RemoteResult, RetryConfig,
    SendTimeouts,
};
pub use gemini::{GeminiConfig, GeminiConnector, GeminiLive, GeminiVoice};
