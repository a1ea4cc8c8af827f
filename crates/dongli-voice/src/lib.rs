//! # Dongli Voice - Conversation Orchestration
//!
//! Voice chat with a persona over whichever backend is reachable. The
//! orchestrator tries each strategy in turn and settles on the first one that
//! comes up, falling back to plain text when every audio path fails.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Voice Orchestrator                          │
//! │                                                                    │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   ┌──────┐ │
//! │  │  Live (WS)   │ → │ Whisper+TTS  │ → │  Qwen relay  │ → │ Text │ │
//! │  │ full duplex  │   │  task API    │   │  SSE stream  │   │      │ │
//! │  └──────────────┘   └──────────────┘   └──────────────┘   └──────┘ │
//! │         ↑                  ↑                  ↑                    │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐            │
//! │  │  Microphone  │   │   Utterance  │   │   Playback   │            │
//! │  │    (cpal)    │   │   recorder   │   │  scheduler   │            │
//! │  └──────────────┘   └──────────────┘   └──────────────┘            │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Presentation code implements [`VoiceEventSink`] (or uses [`ChannelSink`])
//! and plays [`AudioBuffer`]s through [`VoiceOutput`].

pub mod audio;
pub mod codec;
pub mod config;
pub mod credentials;
pub mod error;
pub mod events;
pub mod live;
pub mod live_transport;
pub mod orchestrator;
pub mod playback;
pub mod provider;
pub mod relay;
pub mod synthesis;
pub mod task;
pub mod text;
pub mod transcription;
pub mod utterance;
pub mod whisper;

pub use audio::{AudioBuffer, AudioFrame, CaptureHandle, CaptureStream, CpalMicrophone, Microphone};
pub use config::{AudioSettings, LiveSettings, ProviderSettings, RelaySettings, VoiceConfig};
pub use credentials::CredentialRotation;
pub use error::{VoiceError, VoiceResult};
pub use events::{
    ChannelSink, DriverEvents, DriverPhase, ReplyGenerator, Role, TranscriptEvent, VoiceEvent, VoiceEventSink,
};
pub use live::{LiveDriver, SessionState};
pub use live_transport::{GeminiLiveTransport, LiveTransport};
pub use orchestrator::{
    Availability, Collaborators, ConversationMode, DriverKind, StopHandle, VoiceOrchestrator,
};
pub use playback::{PlaybackScheduler, VoiceOutput};
pub use relay::{HttpRelayClient, RelayClient, RelayDriver};
pub use synthesis::{SpeechSynthesizer, TaskSpeechSynthesizer};
pub use task::{CancelFlag, RetryPolicy};
pub use text::TextDriver;
pub use transcription::{Transcriber, WhisperTranscriber};
pub use whisper::WhisperTtsDriver;
