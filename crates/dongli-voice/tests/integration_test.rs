//! Integration tests for the voice orchestration system
//!
//! Every collaborator is an in-memory fake, so these run without audio
//! hardware or network access.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use dongli_voice::audio::{AudioBuffer, AudioFrame, CaptureHandle, CaptureStream, Microphone};
use dongli_voice::codec::base64_decode;
use dongli_voice::live_transport::{LiveConnection, LiveInbound, LiveOutbound, LiveSetup, LiveTransport};
use dongli_voice::relay::{ByteStream, RelayClient, RelayRequest};
use dongli_voice::synthesis::{SpeechRequest, SpeechSynthesizer, SynthesizedAudio};
use dongli_voice::task::CancelFlag;
use dongli_voice::transcription::{Transcriber, Transcription, TranscriptionRequest};
use dongli_voice::{
    ChannelSink, Collaborators, ConversationMode, CredentialRotation, DriverKind, ReplyGenerator, Role,
    VoiceConfig, VoiceError, VoiceEvent, VoiceOrchestrator, VoiceResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::timeout;

const LIVE_FALLBACK: &str = "Live API不可用，切换到Whisper模式";
const WHISPER_FALLBACK: &str = "Whisper不可用，切换到通义千问模式";
const TEXT_FALLBACK: &str = "语音服务暂时不可用，已切换到文本模式";

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

type FrameFeed = Arc<Mutex<Option<mpsc::UnboundedSender<AudioFrame>>>>;

struct FakeMicrophone {
    fail: bool,
    sample_rate: u32,
    /// Frames of quiet tone queued the moment the microphone opens.
    queued: usize,
    opens: AtomicUsize,
    releases: Arc<AtomicUsize>,
    feed: FrameFeed,
}

impl Default for FakeMicrophone {
    fn default() -> Self {
        Self {
            fail: false,
            sample_rate: 16000,
            queued: 3,
            opens: AtomicUsize::new(0),
            releases: Arc::new(AtomicUsize::new(0)),
            feed: Arc::new(Mutex::new(None)),
        }
    }
}

impl FakeMicrophone {
    fn denied() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn at_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Capture one frame now, as the device would.
    fn capture(&self, value: f32, len: usize) {
        let guard = self.feed.lock().unwrap();
        let tx = guard.as_ref().expect("microphone not open");
        tx.send(AudioFrame {
            samples: vec![value; len],
            sample_rate: self.sample_rate,
            captured_at: Instant::now(),
        })
        .unwrap();
    }
}

#[async_trait]
impl Microphone for FakeMicrophone {
    async fn open(&self) -> VoiceResult<CaptureStream> {
        if self.fail {
            return Err(VoiceError::Permission("microphone access denied".into()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        for _ in 0..self.queued {
            let _ = tx.send(AudioFrame {
                samples: vec![0.1; self.sample_rate as usize / 10],
                sample_rate: self.sample_rate,
                captured_at: Instant::now(),
            });
        }
        *self.feed.lock().unwrap() = Some(tx);
        let feed = self.feed.clone();
        let releases = self.releases.clone();
        Ok(CaptureStream {
            sample_rate: self.sample_rate,
            frames: rx,
            handle: CaptureHandle::new(move || {
                feed.lock().unwrap().take();
                releases.fetch_add(1, Ordering::SeqCst);
            }),
        })
    }
}

#[derive(Clone, Copy, PartialEq)]
enum LiveBehaviour {
    Refuse,
    Open,
    Silent,
}

struct FakeLive {
    behaviour: LiveBehaviour,
    attempts: AtomicUsize,
    inbound: Mutex<Option<mpsc::UnboundedSender<LiveInbound>>>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<LiveOutbound>>>,
}

impl FakeLive {
    fn new(behaviour: LiveBehaviour) -> Self {
        Self {
            behaviour,
            attempts: AtomicUsize::new(0),
            inbound: Mutex::new(None),
            outbound: Mutex::new(None),
        }
    }

    fn push(&self, event: LiveInbound) {
        let guard = self.inbound.lock().unwrap();
        guard.as_ref().expect("no live session").send(event).unwrap();
    }

    fn take_outbound(&self) -> mpsc::UnboundedReceiver<LiveOutbound> {
        self.outbound.lock().unwrap().take().expect("no live session")
    }
}

#[async_trait]
impl LiveTransport for FakeLive {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<LiveConnection> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        assert!(!setup.api_key.is_empty());
        if self.behaviour == LiveBehaviour::Refuse {
            return Err(VoiceError::Network("connection refused".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        if self.behaviour == LiveBehaviour::Open {
            in_tx.send(LiveInbound::Open).unwrap();
        }
        *self.inbound.lock().unwrap() = Some(in_tx);
        *self.outbound.lock().unwrap() = Some(out_rx);
        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

struct FakeTranscriber {
    available: bool,
    text: String,
    sync_calls: AtomicUsize,
    async_calls: AtomicUsize,
}

impl FakeTranscriber {
    fn new(available: bool, text: &str) -> Self {
        Self {
            available,
            text: text.to_string(),
            sync_calls: AtomicUsize::new(0),
            async_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Transcriber for FakeTranscriber {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn transcribe_sync(&self, request: TranscriptionRequest<'_>) -> VoiceResult<Transcription> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        assert_eq!(&request.audio.data[0..4], b"RIFF");
        Ok(Transcription {
            text: self.text.clone(),
            duration: Some(request.audio.duration.as_secs_f64()),
        })
    }

    async fn transcribe_async(
        &self,
        _request: TranscriptionRequest<'_>,
        _cancel: &CancelFlag,
    ) -> VoiceResult<Transcription> {
        self.async_calls.fetch_add(1, Ordering::SeqCst);
        Ok(Transcription {
            text: self.text.clone(),
            duration: None,
        })
    }
}

struct FakeSynthesizer {
    available: bool,
    fail: bool,
}

#[async_trait]
impl SpeechSynthesizer for FakeSynthesizer {
    async fn is_available(&self) -> bool {
        self.available
    }

    async fn synthesize(&self, request: &SpeechRequest, _cancel: &CancelFlag) -> VoiceResult<SynthesizedAudio> {
        if self.fail {
            return Err(VoiceError::Timeout("synthesis task did not finish after 30 polls".into()));
        }
        assert!(!request.text.is_empty());
        Ok(SynthesizedAudio::Inline {
            bytes: vec![0; 8],
            duration: Some(0.5),
        })
    }

    async fn fetch(&self, _url: &str) -> VoiceResult<Vec<u8>> {
        unreachable!("inline audio only")
    }

    async fn render(&self, _audio: SynthesizedAudio) -> VoiceResult<AudioBuffer> {
        Ok(AudioBuffer::mono(24000, vec![0.0; 12000]))
    }
}

struct FakeRelay {
    available: bool,
    chunks: Vec<&'static str>,
    reject: bool,
    probes: AtomicUsize,
    requests: Mutex<Vec<RelayRequest>>,
}

impl FakeRelay {
    fn new(available: bool, chunks: Vec<&'static str>) -> Self {
        Self {
            available,
            chunks,
            reject: false,
            probes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl RelayClient for FakeRelay {
    async fn probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.available
    }

    async fn open_stream(&self, request: &RelayRequest) -> VoiceResult<ByteStream> {
        self.requests.lock().unwrap().push(request.clone());
        if self.reject {
            return Err(VoiceError::Network("relay request failed: 502 Bad Gateway".into()));
        }
        let chunks: Vec<VoiceResult<Bytes>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

struct EchoReplies;

#[async_trait]
impl ReplyGenerator for EchoReplies {
    async fn reply(&self, user_text: &str) -> VoiceResult<String> {
        Ok(format!("你说的是：{}", user_text))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: VoiceOrchestrator,
    events: mpsc::UnboundedReceiver<VoiceEvent>,
    microphone: Arc<FakeMicrophone>,
    live: Arc<FakeLive>,
    transcriber: Arc<FakeTranscriber>,
    relay: Arc<FakeRelay>,
}

struct Setup {
    keys: Vec<&'static str>,
    microphone: FakeMicrophone,
    live: LiveBehaviour,
    handshake_timeout_ms: u64,
    sync_limit_ms: u64,
    whisper: bool,
    tts: bool,
    tts_fails: bool,
    relay: FakeRelay,
    replies: bool,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            keys: vec!["live-key"],
            microphone: FakeMicrophone::default(),
            live: LiveBehaviour::Open,
            handshake_timeout_ms: 1_000,
            sync_limit_ms: 10_000,
            whisper: true,
            tts: true,
            tts_fails: false,
            relay: FakeRelay::new(true, Vec::new()),
            replies: true,
        }
    }
}

impl Setup {
    fn build(self) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let mut config = VoiceConfig::default();
        config.live.handshake_timeout_ms = self.handshake_timeout_ms;
        config.provider.sync_limit_ms = self.sync_limit_ms;

        let microphone = Arc::new(self.microphone);
        let live = Arc::new(FakeLive::new(self.live));
        let transcriber = Arc::new(FakeTranscriber::new(self.whisper, "东里村怎么走"));
        let relay = Arc::new(self.relay);
        let mut collaborators = Collaborators {
            microphone: microphone.clone(),
            live: live.clone(),
            transcriber: transcriber.clone(),
            synthesizer: Arc::new(FakeSynthesizer {
                available: self.tts,
                fail: self.tts_fails,
            }),
            relay: relay.clone(),
            replies: None,
        };
        if self.replies {
            collaborators = collaborators.with_replies(Arc::new(EchoReplies));
        }

        let (sink, events) = ChannelSink::new();
        let orchestrator = VoiceOrchestrator::new(
            config,
            Arc::new(CredentialRotation::new(self.keys)),
            collaborators,
            Arc::new(sink),
        );
        Harness {
            orchestrator,
            events,
            microphone,
            live,
            transcriber,
            relay,
        }
    }
}

impl Harness {
    fn drain(&mut self) -> Vec<VoiceEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }

    /// Collect events until `mode` is reported (inclusive).
    async fn until_mode(&mut self, mode: ConversationMode) -> Vec<VoiceEvent> {
        let mut seen = Vec::new();
        let result = timeout(Duration::from_secs(2), async {
            while let Some(event) = self.events.recv().await {
                let done = event == VoiceEvent::ModeChanged(mode);
                seen.push(event);
                if done {
                    return;
                }
            }
        })
        .await;
        assert!(result.is_ok(), "mode {:?} never reported; saw {:?}", mode, seen);
        seen
    }
}

fn modes(events: &[VoiceEvent]) -> Vec<ConversationMode> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::ModeChanged(m) => Some(*m),
            _ => None,
        })
        .collect()
}

fn statuses(events: &[VoiceEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Status(s) => Some(s.clone()),
            _ => None,
        })
        .collect()
}

fn transcripts(events: &[VoiceEvent]) -> Vec<(Role, String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Transcription(t) => Some((t.role, t.text.clone(), t.is_final)),
            _ => None,
        })
        .collect()
}

/// Decode an outbound media chunk back to its PCM16 samples.
fn media_samples(message: Option<LiveOutbound>) -> (String, Vec<i16>) {
    match message {
        Some(LiveOutbound::Media(chunk)) => {
            let bytes = base64_decode(&chunk.data).unwrap();
            let samples = bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            (chunk.mime_type, samples)
        }
        other => panic!("expected media chunk, got {:?}", other),
    }
}

fn errors(events: &[VoiceEvent]) -> Vec<(&'static str, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::Error { kind, retryable, .. } => Some((*kind, *retryable)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Fallback chain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_success_streams_capture_and_ends_in_live_active() {
    let mut h = Setup::default().build();

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::LiveActive);
    assert_eq!(h.orchestrator.active_driver(), Some(DriverKind::Live));

    let events = h.drain();
    assert_eq!(
        modes(&events),
        vec![ConversationMode::LiveConnecting, ConversationMode::LiveActive]
    );
    assert_eq!(statuses(&events), vec!["已连接到Live API，可以开始对话".to_string()]);

    let mut outbound = h.live.take_outbound();
    h.microphone.capture(0.5, 1600);
    let first = timeout(Duration::from_secs(2), outbound.recv()).await.unwrap();
    let (mime, samples) = media_samples(first);
    assert_eq!(mime, "audio/pcm;rate=16000");
    assert_eq!(samples.len(), 1600);
    assert_eq!(samples[0], 16383);
    assert_eq!(h.relay.probes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn audio_captured_during_the_handshake_is_never_sent() {
    let mut h = Setup {
        live: LiveBehaviour::Silent,
        handshake_timeout_ms: 5_000,
        ..Setup::default()
    }
    .build();

    let live = h.live.clone();
    let microphone = h.microphone.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        // More tone while the remote is still silent.
        microphone.capture(0.1, 1600);
        microphone.capture(0.1, 1600);
        live.push(LiveInbound::Open);
    });

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::LiveActive);
    let mut outbound = h.live.take_outbound();

    h.microphone.capture(0.5, 1600);
    let (_, samples) = media_samples(timeout(Duration::from_secs(2), outbound.recv()).await.unwrap());
    assert!(samples.iter().all(|&s| s == 16383), "pre-open tone reached the socket");
    assert!(timeout(Duration::from_millis(100), outbound.recv()).await.is_err());
}

#[tokio::test]
async fn live_capture_above_the_session_rate_is_downsampled() {
    let mut h = Setup {
        microphone: FakeMicrophone::at_rate(48000),
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    let mut outbound = h.live.take_outbound();

    h.microphone.capture(0.25, 4800);
    let (mime, samples) = media_samples(timeout(Duration::from_secs(2), outbound.recv()).await.unwrap());
    assert_eq!(mime, "audio/pcm;rate=16000");
    assert_eq!(samples.len(), 1600);
}

#[tokio::test]
async fn live_capture_below_the_session_rate_keeps_its_native_rate() {
    let mut h = Setup {
        microphone: FakeMicrophone::at_rate(8000),
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    let mut outbound = h.live.take_outbound();

    h.microphone.capture(0.25, 800);
    let (mime, samples) = media_samples(timeout(Duration::from_secs(2), outbound.recv()).await.unwrap());
    assert_eq!(mime, "audio/pcm;rate=8000");
    assert_eq!(samples.len(), 800);
}

#[tokio::test]
async fn live_failure_falls_back_to_whisper_without_probing_relay() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        ..Setup::default()
    }
    .build();

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::WhisperRecording);
    assert_eq!(h.orchestrator.active_driver(), Some(DriverKind::WhisperTts));

    let events = h.drain();
    assert_eq!(
        modes(&events),
        vec![ConversationMode::LiveConnecting, ConversationMode::WhisperRecording]
    );
    assert_eq!(
        statuses(&events),
        vec![LIVE_FALLBACK.to_string(), "正在录音，说完后点击发送".to_string()]
    );
    assert_eq!(h.relay.probes.load(Ordering::SeqCst), 0);
    // Live opened the mic first and released it when the connect failed.
    assert_eq!(h.microphone.opens(), 2);
    assert_eq!(h.microphone.releases(), 1);
}

#[tokio::test]
async fn missing_live_key_skips_the_socket() {
    let mut h = Setup {
        keys: vec![],
        ..Setup::default()
    }
    .build();

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::WhisperRecording);
    assert_eq!(h.live.attempts.load(Ordering::SeqCst), 0);
    assert_eq!(h.microphone.opens(), 1);
}

#[tokio::test]
async fn handshake_timeout_counts_as_live_failure() {
    let mut h = Setup {
        live: LiveBehaviour::Silent,
        handshake_timeout_ms: 50,
        ..Setup::default()
    }
    .build();

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::WhisperRecording);
    assert!(statuses(&h.drain()).contains(&LIVE_FALLBACK.to_string()));
}

#[tokio::test]
async fn whisper_needs_both_services() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        tts: false,
        ..Setup::default()
    }
    .build();

    let mode = h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(mode, ConversationMode::QwenRecording);
    assert_eq!(h.orchestrator.active_driver(), Some(DriverKind::Relay));

    let events = h.drain();
    assert_eq!(
        statuses(&events),
        vec![
            LIVE_FALLBACK.to_string(),
            WHISPER_FALLBACK.to_string(),
            "通义千问录音中...".to_string()
        ]
    );
    assert_eq!(h.relay.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn everything_down_ends_in_text_mode() {
    let mut h = Setup {
        keys: vec![],
        whisper: false,
        relay: FakeRelay::new(false, Vec::new()),
        ..Setup::default()
    }
    .build();

    let err = h.orchestrator.start_conversation().await.unwrap_err();
    assert!(matches!(err, VoiceError::Exhausted(_)));
    assert_eq!(h.orchestrator.mode(), ConversationMode::TextMode);
    assert_eq!(h.orchestrator.active_driver(), Some(DriverKind::Text));

    let events = h.drain();
    assert_eq!(
        modes(&events),
        vec![ConversationMode::LiveConnecting, ConversationMode::TextMode]
    );
    assert_eq!(statuses(&events).last(), Some(&TEXT_FALLBACK.to_string()));
    assert_eq!(errors(&events), vec![("exhausted", false)]);

    let reply = h.orchestrator.send_text("你好").await.unwrap();
    assert_eq!(reply.as_deref(), Some("你说的是：你好"));
    assert_eq!(
        transcripts(&h.drain()),
        vec![
            (Role::User, "你好".to_string(), true),
            (Role::Model, "你说的是：你好".to_string(), true)
        ]
    );
}

#[tokio::test]
async fn denied_microphone_falls_all_the_way_to_text() {
    let mut h = Setup {
        microphone: FakeMicrophone::denied(),
        ..Setup::default()
    }
    .build();

    let err = h.orchestrator.start_conversation().await.unwrap_err();
    assert!(matches!(err, VoiceError::Exhausted(_)));
    assert_eq!(h.orchestrator.mode(), ConversationMode::TextMode);
    // Live never got as far as the socket.
    assert_eq!(h.live.attempts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn every_availability_combination_lands_in_a_terminal_mode() {
    let terminal = [
        ConversationMode::LiveActive,
        ConversationMode::WhisperRecording,
        ConversationMode::QwenRecording,
        ConversationMode::TextMode,
    ];
    for bits in 0..16u8 {
        let live = bits & 1 != 0;
        let whisper = bits & 2 != 0;
        let tts = bits & 4 != 0;
        let qwen = bits & 8 != 0;
        let mut h = Setup {
            live: if live { LiveBehaviour::Open } else { LiveBehaviour::Refuse },
            whisper,
            tts,
            relay: FakeRelay::new(qwen, Vec::new()),
            ..Setup::default()
        }
        .build();

        let _ = h.orchestrator.start_conversation().await;
        let mode = h.orchestrator.mode();
        assert!(terminal.contains(&mode), "bits {:04b} ended in {:?}", bits, mode);

        let expected = if live {
            ConversationMode::LiveActive
        } else if whisper && tts {
            ConversationMode::WhisperRecording
        } else if qwen {
            ConversationMode::QwenRecording
        } else {
            ConversationMode::TextMode
        };
        assert_eq!(mode, expected, "bits {:04b}", bits);
        h.orchestrator.stop_conversation().await;
    }
}

// ---------------------------------------------------------------------------
// Stop and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_idempotent_and_releases_the_microphone_once() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    let mut outbound = h.live.take_outbound();

    h.orchestrator.stop_conversation().await;
    h.orchestrator.stop_conversation().await;

    assert_eq!(h.orchestrator.mode(), ConversationMode::Idle);
    assert_eq!(h.orchestrator.active_driver(), None);
    assert_eq!(h.microphone.opens(), 1);
    assert_eq!(h.microphone.releases(), 1);

    let events = h.drain();
    assert_eq!(modes(&events).last(), Some(&ConversationMode::Idle));

    // The socket gets exactly one close request.
    let mut closes = 0;
    while let Ok(Some(msg)) = timeout(Duration::from_millis(100), outbound.recv()).await {
        if msg == LiveOutbound::Close {
            closes += 1;
        }
    }
    assert_eq!(closes, 1);
}

#[tokio::test]
async fn stop_from_idle_still_reports_idle() {
    let mut h = Setup::default().build();
    h.orchestrator.stop_conversation().await;
    assert_eq!(modes(&h.drain()), vec![ConversationMode::Idle]);
}

#[tokio::test]
async fn stop_handle_aborts_a_pending_handshake() {
    let mut h = Setup {
        live: LiveBehaviour::Silent,
        handshake_timeout_ms: 60_000,
        ..Setup::default()
    }
    .build();

    let stop = h.orchestrator.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        stop.stop();
    });

    let err = timeout(Duration::from_secs(2), h.orchestrator.start_conversation())
        .await
        .expect("start did not observe the stop")
        .unwrap_err();
    assert!(matches!(err, VoiceError::Cancelled(_)));
    assert_eq!(h.orchestrator.mode(), ConversationMode::Idle);
    assert_eq!(h.microphone.releases(), 1);
    assert!(!statuses(&h.drain()).contains(&LIVE_FALLBACK.to_string()));
}

#[tokio::test]
async fn restart_replaces_the_previous_driver() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    h.orchestrator.start_conversation().await.unwrap();
    assert_eq!(h.microphone.opens(), 2);
    assert_eq!(h.microphone.releases(), 1);
    assert_eq!(h.orchestrator.mode(), ConversationMode::LiveActive);
}

// ---------------------------------------------------------------------------
// Live session events
// ---------------------------------------------------------------------------

#[tokio::test]
async fn live_transcripts_and_audio_are_forwarded() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    h.live.push(LiveInbound::Transcript {
        role: Role::Model,
        text: "欢迎".into(),
    });
    // 2 PCM16 samples, base64
    h.live.push(LiveInbound::Audio("AAD/fw==".into()));
    h.live.push(LiveInbound::Audio("not base64!".into()));
    h.live.push(LiveInbound::Closed(Some("bye".into())));

    let events = h.until_mode(ConversationMode::Idle).await;
    assert_eq!(transcripts(&events), vec![(Role::Model, "欢迎".to_string(), false)]);
    let audio: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            VoiceEvent::AudioData(b) => Some(b.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(audio.len(), 1);
    assert_eq!(audio[0].sample_rate, 24000);
    assert_eq!(audio[0].frames(), 2);
    assert!(errors(&events).is_empty());
    assert_eq!(h.microphone.releases(), 1);
}

#[tokio::test]
async fn live_error_reports_then_returns_to_idle() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    h.live.push(LiveInbound::Error(VoiceError::Network("socket reset".into())));
    let events = h.until_mode(ConversationMode::Idle).await;
    assert_eq!(errors(&events), vec![("network", true)]);
    assert_eq!(modes(&events), vec![ConversationMode::Error, ConversationMode::Idle]);
    assert_eq!(h.microphone.releases(), 1);

    // A later stop does not release again.
    h.orchestrator.stop_conversation().await;
    assert_eq!(h.microphone.releases(), 1);
}

#[tokio::test]
async fn events_after_stop_are_dropped() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    let inbound = h.live.inbound.lock().unwrap().clone().unwrap();
    h.orchestrator.stop_conversation().await;
    h.drain();

    let _ = inbound.send(LiveInbound::Transcript {
        role: Role::Model,
        text: "late".into(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.drain().is_empty());
}

// ---------------------------------------------------------------------------
// Half-duplex turns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn whisper_turn_runs_transcribe_reply_speak() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    h.orchestrator.finish_turn().await.unwrap();
    let events = h.drain();
    assert_eq!(
        modes(&events),
        vec![
            ConversationMode::WhisperProcessing,
            ConversationMode::TtsPlaying,
            ConversationMode::Idle
        ]
    );
    assert_eq!(
        transcripts(&events),
        vec![
            (Role::User, "东里村怎么走".to_string(), true),
            (Role::Model, "你说的是：东里村怎么走".to_string(), true)
        ]
    );
    assert!(events.iter().any(|e| matches!(e, VoiceEvent::AudioData(_))));
    assert_eq!(h.transcriber.sync_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transcriber.async_calls.load(Ordering::SeqCst), 0);

    // Next turn re-opens the microphone.
    h.orchestrator.begin_turn().await.unwrap();
    assert_eq!(h.orchestrator.mode(), ConversationMode::WhisperRecording);
}

#[tokio::test]
async fn long_utterances_go_through_the_task_api() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        sync_limit_ms: 100,
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    // 0.3s queued at open, over the 0.1s limit.
    h.orchestrator.finish_turn().await.unwrap();
    assert_eq!(h.transcriber.async_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.transcriber.sync_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        transcripts(&h.drain()).first(),
        Some(&(Role::User, "东里村怎么走".to_string(), true))
    );
}

#[tokio::test]
async fn whisper_turn_without_reply_generator_only_transcribes() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        replies: false,
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    h.orchestrator.finish_turn().await.unwrap();
    let events = h.drain();
    assert_eq!(
        transcripts(&events),
        vec![(Role::User, "东里村怎么走".to_string(), true)]
    );
    assert_eq!(
        modes(&events),
        vec![ConversationMode::WhisperProcessing, ConversationMode::Idle]
    );
}

#[tokio::test]
async fn whisper_turn_failure_is_retryable_and_returns_to_idle() {
    let mut h = Setup {
        live: LiveBehaviour::Refuse,
        tts_fails: true,
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    let err = h.orchestrator.finish_turn().await.unwrap_err();
    assert!(matches!(err, VoiceError::Timeout(_)));
    let events = h.drain();
    assert_eq!(errors(&events), vec![("timeout", true)]);
    assert_eq!(modes(&events).last(), Some(&ConversationMode::Idle));
}

#[tokio::test]
async fn relay_turn_streams_text_deltas_and_closes_once() {
    let mut h = Setup {
        keys: vec![],
        whisper: false,
        relay: FakeRelay::new(
            true,
            vec![
                "data: {\"choices\":[{\"delta\":{\"content\":\"你好\"}}]}\n\nda",
                "ta: {\"choices\":[{\"delta\":{\"content\":\"，\"}}]}\n\n",
                "data: [DONE]\n\n",
            ],
        ),
        ..Setup::default()
    }
    .build();
    assert_eq!(
        h.orchestrator.start_conversation().await.unwrap(),
        ConversationMode::QwenRecording
    );
    h.drain();

    h.orchestrator.finish_turn().await.unwrap();
    let events = h.drain();
    assert_eq!(
        transcripts(&events),
        vec![
            (Role::Model, "你好".to_string(), false),
            (Role::Model, "，".to_string(), false)
        ]
    );
    assert_eq!(
        modes(&events),
        vec![ConversationMode::QwenProcessing, ConversationMode::Idle]
    );

    let requests = h.relay.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let audio = &requests[0].messages[0].content[0].audio;
    assert_eq!(audio.format, "wav");
    assert_eq!(audio.sample_rate, 16000);
}

#[tokio::test]
async fn relay_hard_failure_drops_to_text_mode() {
    let mut relay = FakeRelay::new(true, Vec::new());
    relay.reject = true;
    let mut h = Setup {
        keys: vec![],
        whisper: false,
        relay,
        ..Setup::default()
    }
    .build();
    h.orchestrator.start_conversation().await.unwrap();
    h.drain();

    let err = h.orchestrator.finish_turn().await.unwrap_err();
    assert!(matches!(err, VoiceError::Network(_)));
    assert_eq!(h.orchestrator.mode(), ConversationMode::TextMode);
    let events = h.drain();
    assert_eq!(errors(&events), vec![("network", false)]);
    assert_eq!(statuses(&events), vec![TEXT_FALLBACK.to_string()]);
}

#[tokio::test]
async fn turns_need_a_half_duplex_driver() {
    let mut h = Setup::default().build();
    h.orchestrator.start_conversation().await.unwrap();
    assert!(matches!(
        h.orchestrator.finish_turn().await,
        Err(VoiceError::Protocol(_))
    ));
}

#[tokio::test]
async fn availability_probe_does_not_change_mode() {
    let h = Setup {
        tts: false,
        ..Setup::default()
    }
    .build();
    let availability = h.orchestrator.check_availability().await;
    assert!(availability.live);
    assert!(availability.whisper);
    assert!(!availability.tts);
    assert!(availability.qwen);
    assert_eq!(h.orchestrator.mode(), ConversationMode::Idle);
}
