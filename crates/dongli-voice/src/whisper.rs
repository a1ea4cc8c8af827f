//! Half-duplex Whisper + TTS driver.
//!
//! One turn: record → seal → transcribe (sync or task) → user transcript →
//! optional reply → synthesize → audio. The driver reports each step through
//! [`DriverEvents`] and closes the turn with `on_close`.

use crate::audio::Microphone;
use crate::config::{AudioSettings, ProviderSettings};
use crate::error::VoiceResult;
use crate::events::{DriverEvents, DriverPhase, ReplyGenerator, Role, TranscriptEvent};
use crate::synthesis::{SpeechRequest, SpeechSynthesizer};
use crate::task::CancelFlag;
use crate::transcription::{Transcriber, TranscriptionRequest};
use crate::utterance::{UtteranceFormat, UtteranceRecorder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct WhisperTurnConfig {
    pub sample_rate: u32,
    pub language: String,
    pub prompt: Option<String>,
    /// Utterances up to this length use the synchronous endpoint.
    pub sync_limit: Duration,
    pub voice: String,
    pub speed: f32,
}

impl WhisperTurnConfig {
    pub fn from_settings(audio: &AudioSettings, provider: &ProviderSettings) -> Self {
        Self {
            sample_rate: audio.input_sample_rate,
            language: provider.language.clone(),
            prompt: provider.prompt.clone(),
            sync_limit: provider.sync_limit(),
            voice: provider.voice.clone(),
            speed: provider.speed,
        }
    }
}

/// What a finished turn produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnOutcome {
    pub user_text: String,
    pub reply_text: Option<String>,
    pub spoke: bool,
}

pub struct WhisperTtsDriver {
    recorder: UtteranceRecorder,
    transcriber: Arc<dyn Transcriber>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    replies: Option<Arc<dyn ReplyGenerator>>,
    events: Arc<dyn DriverEvents>,
    config: WhisperTurnConfig,
}

impl WhisperTtsDriver {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        replies: Option<Arc<dyn ReplyGenerator>>,
        events: Arc<dyn DriverEvents>,
        config: WhisperTurnConfig,
    ) -> Self {
        Self {
            recorder: UtteranceRecorder::new(microphone),
            transcriber,
            synthesizer,
            replies,
            events,
            config,
        }
    }

    /// Both services must answer; probed concurrently.
    pub async fn probe(transcriber: &dyn Transcriber, synthesizer: &dyn SpeechSynthesizer) -> bool {
        let (stt, tts) = tokio::join!(transcriber.is_available(), synthesizer.is_available());
        if !stt || !tts {
            info!("Whisper/TTS availability: stt={} tts={}", stt, tts);
        }
        stt && tts
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub async fn start_recording(&mut self) -> VoiceResult<()> {
        self.recorder.start().await?;
        self.events.on_phase(DriverPhase::Recording);
        Ok(())
    }

    /// Stop recording and run the rest of the turn.
    pub async fn finish_turn(&mut self, cancel: &CancelFlag) -> VoiceResult<TurnOutcome> {
        let utterance = self.recorder.stop().await?;
        self.events.on_phase(DriverPhase::Processing);

        let sealed = utterance.seal(self.config.sample_rate, UtteranceFormat::Wav)?;
        if sealed.is_empty() {
            warn!("Whisper: empty utterance, nothing to transcribe");
            self.events.on_close();
            return Ok(TurnOutcome::default());
        }

        let request = TranscriptionRequest {
            audio: &sealed,
            language: &self.config.language,
            prompt: self.config.prompt.as_deref(),
        };
        let transcription = if sealed.duration <= self.config.sync_limit {
            self.transcriber.transcribe_sync(request).await?
        } else {
            self.transcriber.transcribe_async(request, cancel).await?
        };
        cancel.check("Whisper turn")?;

        let user_text = transcription.text.trim().to_string();
        if user_text.is_empty() {
            info!("Whisper: nothing recognised");
            self.events.on_close();
            return Ok(TurnOutcome::default());
        }
        self.events
            .on_transcript(TranscriptEvent::new(Role::User, user_text.clone(), true));

        let Some(replies) = self.replies.clone() else {
            self.events.on_close();
            return Ok(TurnOutcome {
                user_text,
                ..TurnOutcome::default()
            });
        };

        let reply = replies.reply(&user_text).await?;
        cancel.check("Whisper turn")?;
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            self.events.on_close();
            return Ok(TurnOutcome {
                user_text,
                ..TurnOutcome::default()
            });
        }
        self.events
            .on_transcript(TranscriptEvent::new(Role::Model, reply.clone(), true));

        let speech = SpeechRequest {
            text: reply.clone(),
            voice: self.config.voice.clone(),
            speed: self.config.speed,
        };
        let audio = self.synthesizer.synthesize(&speech, cancel).await?;
        let buffer = self.synthesizer.render(audio).await?;
        cancel.check("Whisper turn")?;
        self.events.on_phase(DriverPhase::Speaking);
        self.events.on_audio(buffer);
        self.events.on_close();

        Ok(TurnOutcome {
            user_text,
            reply_text: Some(reply),
            spoke: true,
        })
    }

    /// Drop any recording in progress. Idempotent.
    pub fn cancel(&mut self) {
        self.recorder.cancel();
    }
}
