//! Event contracts between drivers, the orchestrator and the presentation layer.
//!
//! Drivers report through [`DriverEvents`]; the orchestrator turns those into
//! mode changes and forwards them to a [`VoiceEventSink`]. [`ChannelSink`] is a
//! ready-made sink that queues [`VoiceEvent`]s on a tokio channel.

use crate::audio::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use crate::orchestrator::ConversationMode;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Speaker of a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub role: Role,
    pub text: String,
    /// False for streaming deltas that will be followed by more text.
    pub is_final: bool,
    pub at: DateTime<Utc>,
}

impl TranscriptEvent {
    pub fn new(role: Role, text: impl Into<String>, is_final: bool) -> Self {
        Self {
            role,
            text: text.into(),
            is_final,
            at: Utc::now(),
        }
    }
}

/// Lifecycle points a driver reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverPhase {
    /// Remote session confirmed open (full-duplex).
    Open,
    /// Microphone is capturing an utterance.
    Recording,
    /// Utterance sealed and submitted.
    Processing,
    /// Synthesized reply is being delivered.
    Speaking,
}

/// Callbacks a driver invokes. Implementations must be cheap; they are called
/// from driver tasks.
pub trait DriverEvents: Send + Sync {
    fn on_phase(&self, phase: DriverPhase);
    fn on_close(&self);
    fn on_transcript(&self, event: TranscriptEvent);
    fn on_audio(&self, buffer: AudioBuffer);
    fn on_error(&self, error: VoiceError);
}

/// Outward-facing events of the orchestrator.
pub trait VoiceEventSink: Send + Sync {
    fn on_mode_change(&self, mode: ConversationMode);
    fn on_transcription(&self, event: &TranscriptEvent);
    fn on_audio_data(&self, buffer: &AudioBuffer);
    fn on_error(&self, error: &VoiceError, retryable: bool);
    /// Human-readable status line (fallback notices).
    fn on_message(&self, _message: &str) {}
}

/// Produces the persona's reply for a user utterance.
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    async fn reply(&self, user_text: &str) -> VoiceResult<String>;
}

/// Owned form of everything a [`VoiceEventSink`] receives.
#[derive(Debug, Clone, PartialEq)]
pub enum VoiceEvent {
    ModeChanged(ConversationMode),
    Transcription(TranscriptEvent),
    AudioData(AudioBuffer),
    Error {
        kind: &'static str,
        message: String,
        retryable: bool,
    },
    Status(String),
}

/// Sink that forwards every event onto an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<VoiceEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<VoiceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Same as [`new`](Self::new) but yields a `Stream` of events.
    pub fn stream() -> (Self, UnboundedReceiverStream<VoiceEvent>) {
        let (sink, rx) = Self::new();
        (sink, UnboundedReceiverStream::new(rx))
    }

    fn send(&self, event: VoiceEvent) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl VoiceEventSink for ChannelSink {
    fn on_mode_change(&self, mode: ConversationMode) {
        self.send(VoiceEvent::ModeChanged(mode));
    }

    fn on_transcription(&self, event: &TranscriptEvent) {
        self.send(VoiceEvent::Transcription(event.clone()));
    }

    fn on_audio_data(&self, buffer: &AudioBuffer) {
        self.send(VoiceEvent::AudioData(buffer.clone()));
    }

    fn on_error(&self, error: &VoiceError, retryable: bool) {
        self.send(VoiceEvent::Error {
            kind: error.kind(),
            message: error.to_string(),
            retryable,
        });
    }

    fn on_message(&self, message: &str) {
        self.send(VoiceEvent::Status(message.to_string()));
    }
}
