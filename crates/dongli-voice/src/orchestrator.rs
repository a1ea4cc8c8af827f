//! Voice Orchestrator - the fallback state machine
//!
//! `start_conversation` walks the strategies in order and settles on the
//! first that comes up:
//!
//! ```text
//!   Live (full duplex) ──fail──▶ Whisper + TTS ──fail──▶ Qwen relay ──fail──▶ Text
//!   LiveConnecting→LiveActive    WhisperRecording        QwenRecording        TextMode
//! ```
//!
//! Exactly one driver is active at a time. Drivers report through a bridge
//! tagged with a generation number; events from a driver that has since been
//! replaced or stopped are dropped.

use crate::audio::{AudioBuffer, CpalMicrophone, Microphone};
use crate::config::VoiceConfig;
use crate::credentials::CredentialRotation;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{DriverEvents, DriverPhase, ReplyGenerator, TranscriptEvent, VoiceEventSink};
use crate::live::{LiveDriver, LiveSessionConfig};
use crate::live_transport::{GeminiLiveTransport, LiveTransport};
use crate::relay::{HttpRelayClient, RelayClient, RelayDriver};
use crate::synthesis::{SpeechSynthesizer, TaskSpeechSynthesizer};
use crate::task::CancelFlag;
use crate::text::TextDriver;
use crate::transcription::{Transcriber, WhisperTranscriber};
use crate::whisper::{WhisperTtsDriver, WhisperTurnConfig};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const MSG_LIVE_READY: &str = "已连接到Live API，可以开始对话";
const MSG_LIVE_FALLBACK: &str = "Live API不可用，切换到Whisper模式";
const MSG_WHISPER_READY: &str = "正在录音，说完后点击发送";
const MSG_WHISPER_FALLBACK: &str = "Whisper不可用，切换到通义千问模式";
const MSG_QWEN_READY: &str = "通义千问录音中...";
const MSG_TEXT_FALLBACK: &str = "语音服务暂时不可用，已切换到文本模式";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationMode {
    Idle,
    LiveConnecting,
    LiveActive,
    WhisperRecording,
    WhisperProcessing,
    TtsPlaying,
    QwenRecording,
    QwenProcessing,
    TextMode,
    /// Transient: a driver failed mid-session. Always followed by `Idle`.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Live,
    WhisperTts,
    Relay,
    Text,
}

/// Which strategies could be used right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Availability {
    pub live: bool,
    pub whisper: bool,
    pub tts: bool,
    pub qwen: bool,
}

/// External services and devices the drivers run against.
#[derive(Clone)]
pub struct Collaborators {
    pub microphone: Arc<dyn Microphone>,
    pub live: Arc<dyn LiveTransport>,
    pub transcriber: Arc<dyn Transcriber>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub relay: Arc<dyn RelayClient>,
    pub replies: Option<Arc<dyn ReplyGenerator>>,
}

impl Collaborators {
    /// Production wiring: CPAL microphone, Gemini Live socket, hosted task API, local relay.
    pub fn from_config(config: &VoiceConfig) -> VoiceResult<Self> {
        Ok(Self {
            microphone: Arc::new(CpalMicrophone::new(config.audio.clone())),
            live: Arc::new(GeminiLiveTransport::new(config.live.ws_url.clone())),
            transcriber: Arc::new(WhisperTranscriber::new(&config.provider)?),
            synthesizer: Arc::new(TaskSpeechSynthesizer::new(&config.provider)?),
            relay: Arc::new(HttpRelayClient::new(&config.relay)?),
            replies: None,
        })
    }

    pub fn with_replies(mut self, replies: Arc<dyn ReplyGenerator>) -> Self {
        self.replies = Some(replies);
        self
    }
}

/// Mode, generation and cancellation shared with driver bridges.
struct EventHub {
    sink: Arc<dyn VoiceEventSink>,
    mode: Mutex<ConversationMode>,
    generation: AtomicU64,
    cancel: Mutex<CancelFlag>,
}

impl EventHub {
    fn lock_mode(&self) -> MutexGuard<'_, ConversationMode> {
        match self.mode.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_mode(&self, mode: ConversationMode) {
        let mut slot = self.lock_mode();
        self.write_mode(&mut slot, mode);
    }

    fn write_mode(&self, slot: &mut ConversationMode, mode: ConversationMode) {
        *slot = mode;
        debug!("mode → {:?}", mode);
        self.sink.on_mode_change(mode);
    }

    fn mode(&self) -> ConversationMode {
        *self.lock_mode()
    }

    /// Run `emit` under the mode lock if `generation` is still current.
    /// [`EventHub::advance`] takes the same lock, so nothing a stale driver
    /// emits can land after the event that follows an advance.
    fn emit_if_current(&self, generation: u64, emit: impl FnOnce(&mut ConversationMode)) -> bool {
        let mut slot = self.lock_mode();
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        emit(&mut slot);
        true
    }

    fn status(&self, message: &str) {
        info!("💬 {}", message);
        self.sink.on_message(message);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Invalidate every bridge handed out so far.
    fn advance(&self) -> u64 {
        let _slot = self.lock_mode();
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn current_cancel(&self) -> CancelFlag {
        match self.cancel.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn fresh_cancel(&self) -> CancelFlag {
        let flag = CancelFlag::new();
        match self.cancel.lock() {
            Ok(mut guard) => *guard = flag.clone(),
            Err(poisoned) => *poisoned.into_inner() = flag.clone(),
        }
        flag
    }
}

/// Adapts driver callbacks to orchestrator events for one driver instance.
struct DriverBridge {
    kind: DriverKind,
    generation: u64,
    hub: Arc<EventHub>,
}

impl DriverBridge {
    fn emit(&self, emit: impl FnOnce(&EventHub, &mut ConversationMode)) {
        let hub: &EventHub = &self.hub;
        if !hub.emit_if_current(self.generation, |slot| emit(hub, slot)) {
            debug!("dropping stale {:?} event (generation {})", self.kind, self.generation);
        }
    }
}

impl DriverEvents for DriverBridge {
    fn on_phase(&self, phase: DriverPhase) {
        let mode = match (self.kind, phase) {
            (DriverKind::Live, DriverPhase::Open) => Some(ConversationMode::LiveActive),
            (DriverKind::WhisperTts, DriverPhase::Recording) => Some(ConversationMode::WhisperRecording),
            (DriverKind::WhisperTts, DriverPhase::Processing) => Some(ConversationMode::WhisperProcessing),
            (DriverKind::WhisperTts, DriverPhase::Speaking) => Some(ConversationMode::TtsPlaying),
            (DriverKind::Relay, DriverPhase::Recording) => Some(ConversationMode::QwenRecording),
            (DriverKind::Relay, DriverPhase::Processing) => Some(ConversationMode::QwenProcessing),
            _ => None,
        };
        if let Some(mode) = mode {
            self.emit(|hub, slot| hub.write_mode(slot, mode));
        }
    }

    fn on_close(&self) {
        self.emit(|hub, slot| hub.write_mode(slot, ConversationMode::Idle));
    }

    fn on_transcript(&self, event: TranscriptEvent) {
        self.emit(|hub, _| hub.sink.on_transcription(&event));
    }

    fn on_audio(&self, buffer: AudioBuffer) {
        self.emit(|hub, _| hub.sink.on_audio_data(&buffer));
    }

    fn on_error(&self, error: VoiceError) {
        let kind = self.kind;
        self.emit(|hub, slot| {
            warn!("⚠️ {:?} driver error: {}", kind, error);
            hub.sink.on_error(&error, error.is_retryable());
            hub.write_mode(slot, ConversationMode::Error);
            hub.write_mode(slot, ConversationMode::Idle);
        });
    }
}

enum ActiveDriver {
    None,
    Live(LiveDriver),
    WhisperTts(WhisperTtsDriver),
    Relay(RelayDriver),
    Text(TextDriver),
}

impl ActiveDriver {
    fn kind(&self) -> Option<DriverKind> {
        match self {
            ActiveDriver::None => None,
            ActiveDriver::Live(_) => Some(DriverKind::Live),
            ActiveDriver::WhisperTts(_) => Some(DriverKind::WhisperTts),
            ActiveDriver::Relay(_) => Some(DriverKind::Relay),
            ActiveDriver::Text(_) => Some(DriverKind::Text),
        }
    }
}

/// Cancels in-flight work (handshake, polling, relay stream) from another task.
/// The cancelled call then tears its driver down and the mode ends in `Idle`.
#[derive(Clone)]
pub struct StopHandle {
    hub: Arc<EventHub>,
}

impl StopHandle {
    pub fn stop(&self) {
        info!("⏹️ Stop requested");
        self.hub.current_cancel().cancel();
    }
}

/// The main voice orchestration system
pub struct VoiceOrchestrator {
    config: VoiceConfig,
    credentials: Arc<CredentialRotation>,
    collaborators: Collaborators,
    hub: Arc<EventHub>,
    active: ActiveDriver,
}

impl VoiceOrchestrator {
    pub fn new(
        config: VoiceConfig,
        credentials: Arc<CredentialRotation>,
        collaborators: Collaborators,
        sink: Arc<dyn VoiceEventSink>,
    ) -> Self {
        info!("🎭 Initializing Voice Orchestrator ({} Live key(s))", credentials.len());
        Self {
            config,
            credentials,
            collaborators,
            hub: Arc::new(EventHub {
                sink,
                mode: Mutex::new(ConversationMode::Idle),
                generation: AtomicU64::new(0),
                cancel: Mutex::new(CancelFlag::new()),
            }),
            active: ActiveDriver::None,
        }
    }

    /// Production orchestrator; Live keys come from `config.live.api_keys`.
    pub fn from_config(config: VoiceConfig, sink: Arc<dyn VoiceEventSink>) -> VoiceResult<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        let credentials = Arc::new(CredentialRotation::new(config.live.api_keys.clone()));
        Ok(Self::new(config, credentials, collaborators, sink))
    }

    pub fn mode(&self) -> ConversationMode {
        self.hub.mode()
    }

    pub fn active_driver(&self) -> Option<DriverKind> {
        self.active.kind()
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { hub: self.hub.clone() }
    }

    fn bridge(&self, kind: DriverKind) -> Arc<dyn DriverEvents> {
        Arc::new(DriverBridge {
            kind,
            generation: self.hub.advance(),
            hub: self.hub.clone(),
        })
    }

    /// Walk the fallback chain. Ends in `LiveActive`, `WhisperRecording`,
    /// `QwenRecording` or `TextMode`; in the last case the exhaustion is also
    /// returned as an error. A [`StopHandle`] stop during startup ends in `Idle`.
    pub async fn start_conversation(&mut self) -> VoiceResult<ConversationMode> {
        info!("🚀 Starting conversation");
        self.teardown().await;
        let cancel = self.hub.fresh_cancel();

        match self.try_live(&cancel).await {
            Ok(()) => {
                self.hub.status(MSG_LIVE_READY);
                return Ok(self.mode());
            }
            Err(e) => {
                warn!("⚠️ Live API unavailable ({}): {}", e.kind(), e);
                if cancel.is_cancelled() {
                    return self.abort_start().await;
                }
                self.hub.status(MSG_LIVE_FALLBACK);
            }
        }

        match self.try_whisper(&cancel).await {
            Ok(()) => {
                self.hub.status(MSG_WHISPER_READY);
                return Ok(self.mode());
            }
            Err(e) => {
                warn!("⚠️ Whisper mode unavailable ({}): {}", e.kind(), e);
                if cancel.is_cancelled() {
                    return self.abort_start().await;
                }
                self.hub.status(MSG_WHISPER_FALLBACK);
            }
        }

        match self.try_relay(&cancel).await {
            Ok(()) => {
                self.hub.status(MSG_QWEN_READY);
                return Ok(self.mode());
            }
            Err(e) => {
                warn!("⚠️ Qwen relay unavailable ({}): {}", e.kind(), e);
                if cancel.is_cancelled() {
                    return self.abort_start().await;
                }
            }
        }

        self.enter_text_mode();
        self.hub.status(MSG_TEXT_FALLBACK);
        let err = VoiceError::Exhausted("Live, Whisper and Qwen relay all failed".to_string());
        error!("❌ {}", err);
        self.hub.sink.on_error(&err, false);
        Err(err)
    }

    async fn abort_start(&mut self) -> VoiceResult<ConversationMode> {
        self.stop_conversation().await;
        Err(VoiceError::Cancelled("conversation start".to_string()))
    }

    async fn try_live(&mut self, cancel: &CancelFlag) -> VoiceResult<()> {
        self.hub.set_mode(ConversationMode::LiveConnecting);
        let key = self
            .credentials
            .next()
            .ok_or_else(|| VoiceError::Configuration("no Live API key configured".to_string()))?;
        let mut driver = LiveDriver::new(
            self.collaborators.live.clone(),
            self.collaborators.microphone.clone(),
            LiveSessionConfig::from_settings(&self.config.audio, &self.config.live),
            self.bridge(DriverKind::Live),
        );
        driver.connect(key, cancel).await?;
        self.active = ActiveDriver::Live(driver);
        Ok(())
    }

    async fn try_whisper(&mut self, cancel: &CancelFlag) -> VoiceResult<()> {
        let available = WhisperTtsDriver::probe(
            self.collaborators.transcriber.as_ref(),
            self.collaborators.synthesizer.as_ref(),
        )
        .await;
        if !available {
            return Err(VoiceError::Network("Whisper or TTS service not available".to_string()));
        }
        cancel.check("conversation start")?;

        let mut driver = WhisperTtsDriver::new(
            self.collaborators.microphone.clone(),
            self.collaborators.transcriber.clone(),
            self.collaborators.synthesizer.clone(),
            self.collaborators.replies.clone(),
            self.bridge(DriverKind::WhisperTts),
            WhisperTurnConfig::from_settings(&self.config.audio, &self.config.provider),
        );
        driver.start_recording().await?;
        self.active = ActiveDriver::WhisperTts(driver);
        Ok(())
    }

    async fn try_relay(&mut self, cancel: &CancelFlag) -> VoiceResult<()> {
        if !self.collaborators.relay.probe().await {
            return Err(VoiceError::Network("Qwen relay backend not reachable".to_string()));
        }
        cancel.check("conversation start")?;

        let mut driver = RelayDriver::new(
            self.collaborators.microphone.clone(),
            self.collaborators.relay.clone(),
            self.bridge(DriverKind::Relay),
            &self.config.audio,
            &self.config.relay,
        );
        driver.start_recording().await?;
        self.active = ActiveDriver::Relay(driver);
        Ok(())
    }

    fn enter_text_mode(&mut self) {
        let driver = TextDriver::new(self.bridge(DriverKind::Text), self.collaborators.replies.clone());
        self.active = ActiveDriver::Text(driver);
        self.hub.set_mode(ConversationMode::TextMode);
    }

    /// Cancel in-flight work and tear down whichever driver is active.
    async fn teardown(&mut self) {
        self.hub.current_cancel().cancel();
        self.hub.advance();
        match std::mem::replace(&mut self.active, ActiveDriver::None) {
            ActiveDriver::Live(mut driver) => driver.disconnect().await,
            ActiveDriver::WhisperTts(mut driver) => driver.cancel(),
            ActiveDriver::Relay(mut driver) => driver.cancel(),
            ActiveDriver::Text(_) | ActiveDriver::None => {}
        }
    }

    /// Stop whatever is running. Idempotent; always ends by emitting `Idle`.
    pub async fn stop_conversation(&mut self) {
        info!("⏹️ Stopping conversation");
        self.teardown().await;
        self.hub.set_mode(ConversationMode::Idle);
    }

    /// Re-open recording on the active half-duplex driver.
    pub async fn begin_turn(&mut self) -> VoiceResult<()> {
        let result = match &mut self.active {
            ActiveDriver::WhisperTts(driver) => driver.start_recording().await,
            ActiveDriver::Relay(driver) => driver.start_recording().await,
            _ => Err(VoiceError::Protocol(format!(
                "no half-duplex driver active (mode {:?})",
                self.hub.mode()
            ))),
        };
        if let Err(e) = &result {
            warn!("⚠️ Could not start recording: {}", e);
            self.hub.sink.on_error(e, e.is_retryable());
        }
        result
    }

    /// Seal the current utterance and run the turn to completion.
    pub async fn finish_turn(&mut self) -> VoiceResult<()> {
        let cancel = self.hub.current_cancel();
        let (kind, result) = match &mut self.active {
            ActiveDriver::WhisperTts(driver) => {
                (DriverKind::WhisperTts, driver.finish_turn(&cancel).await.map(|outcome| {
                    debug!("Whisper turn: {:?}", outcome);
                }))
            }
            ActiveDriver::Relay(driver) => (DriverKind::Relay, driver.finish_turn(&cancel).await.map(|summary| {
                debug!("Relay turn: {:?}", summary);
            })),
            _ => {
                return Err(VoiceError::Protocol(format!(
                    "no half-duplex turn in progress (mode {:?})",
                    self.hub.mode()
                )))
            }
        };

        let Err(e) = result else {
            return Ok(());
        };
        if matches!(e, VoiceError::Cancelled(_)) {
            self.stop_conversation().await;
            return Err(e);
        }
        match kind {
            DriverKind::Relay => {
                warn!("⚠️ Qwen relay turn failed, falling back to text: {}", e);
                self.hub.sink.on_error(&e, false);
                self.enter_text_mode();
                self.hub.status(MSG_TEXT_FALLBACK);
            }
            _ => {
                warn!("⚠️ Whisper turn failed: {}", e);
                self.hub.sink.on_error(&e, true);
                self.hub.set_mode(ConversationMode::Error);
                self.hub.set_mode(ConversationMode::Idle);
            }
        }
        Err(e)
    }

    /// Send typed text. Works in every mode.
    pub async fn send_text(&mut self, text: &str) -> VoiceResult<Option<String>> {
        let result = match &self.active {
            ActiveDriver::Text(driver) => driver.send(text).await,
            _ => {
                let bridge: Arc<dyn DriverEvents> = Arc::new(DriverBridge {
                    kind: DriverKind::Text,
                    generation: self.hub.generation(),
                    hub: self.hub.clone(),
                });
                TextDriver::new(bridge, self.collaborators.replies.clone())
                    .send(text)
                    .await
            }
        };
        if let Err(e) = &result {
            self.hub.sink.on_error(e, e.is_retryable());
        }
        result
    }

    /// Probe every strategy without changing state.
    pub async fn check_availability(&self) -> Availability {
        let c = &self.collaborators;
        let (whisper, tts, qwen) = tokio::join!(
            c.transcriber.is_available(),
            c.synthesizer.is_available(),
            c.relay.probe()
        );
        Availability {
            live: !self.credentials.is_empty(),
            whisper,
            tts,
            qwen,
        }
    }
}
