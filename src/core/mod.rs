pub mod capture;
pub mod codec;
pub mod playback;
pub mod remote;

// Re-export commonly used types for convenience
pub use codec::{AudioChunk, CodecError, CodecResult};

pub use playback::{
    AudioClock, ChunkId, ManualClock, MonotonicClock, PlaybackEvent, PlaybackScheduler,
    PlaybackSink, ScheduledChunk, ToneSpec,
};

pub use capture::{
    CaptureConfig, CaptureError, CaptureEvent, CaptureFrame, CapturePipeline, CaptureResult,
    CaptureSource, CaptureStreams, ClientCaptureSource, ClientMicrophone,
};

pub use remote::{
    BoxedRemote, ErrorCategory, GeminiConfig, GeminiConnector, GeminiLive, GeminiVoice,
    RemoteChannel, RemoteConnector, RemoteError, RemoteEvent, RemoteInput, RemoteResult,
};
