//! Full-duplex Live driver.
//!
//! Lifecycle: `Disconnected → Connecting → Open → Closing → Disconnected`.
//! The session state is one tagged value behind one lock ([`SessionGate`]);
//! every outbound send re-checks it while holding the lock, so a close or
//! error that races with a captured frame can never leak a send on a closed
//! session. Frames captured before the remote confirms the session are
//! discarded, never sent.

use crate::audio::{AudioFrame, CaptureHandle, Microphone};
use crate::codec::{base64_decode, pcm16_to_float, resample, MediaChunk};
use crate::config::{AudioSettings, LiveSettings};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{DriverEvents, DriverPhase, TranscriptEvent};
use crate::live_transport::{LiveConnection, LiveInbound, LiveOutbound, LiveSetup, LiveTransport};
use crate::task::CancelFlag;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

/// The single source of truth for whether sending is allowed.
#[derive(Debug)]
pub struct SessionGate {
    state: Mutex<SessionState>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self {
            state: Mutex::new(SessionState::Disconnected),
        }
    }
}

impl SessionGate {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.lock()
    }

    /// Disconnected → Connecting. False if a session is already in progress.
    pub fn begin_connect(&self) -> bool {
        let mut state = self.lock();
        if *state != SessionState::Disconnected {
            return false;
        }
        *state = SessionState::Connecting;
        true
    }

    /// Connecting → Open. False if the session was closed meanwhile.
    pub fn mark_open(&self) -> bool {
        let mut state = self.lock();
        if *state != SessionState::Connecting {
            return false;
        }
        *state = SessionState::Open;
        true
    }

    /// Enter Closing. Returns true for the caller that initiated the close.
    pub fn begin_close(&self) -> bool {
        let mut state = self.lock();
        match *state {
            SessionState::Connecting | SessionState::Open => {
                *state = SessionState::Closing;
                true
            }
            SessionState::Closing | SessionState::Disconnected => false,
        }
    }

    pub fn mark_disconnected(&self) {
        *self.lock() = SessionState::Disconnected;
    }

    /// Run `send` only if the session is open, holding the lock across the
    /// check and the send.
    pub fn send_if_open(&self, send: impl FnOnce() -> bool) -> bool {
        let state = self.lock();
        if *state != SessionState::Open {
            return false;
        }
        send()
    }
}

/// Session resources; each is taken (and released) at most once.
#[derive(Default)]
struct SessionResources {
    capture: Mutex<Option<CaptureHandle>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<LiveOutbound>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl SessionResources {
    fn take<T>(slot: &Mutex<Option<T>>) -> Option<T> {
        match slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn put<T>(slot: &Mutex<Option<T>>, value: T) {
        match slot.lock() {
            Ok(mut guard) => *guard = Some(value),
            Err(poisoned) => *poisoned.into_inner() = Some(value),
        }
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<LiveOutbound>> {
        match self.outbound.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Stop capture, close the socket and stop the pump. Idempotent.
    fn release(&self) {
        if let Some(pump) = Self::take(&self.pump) {
            pump.abort();
        }
        if let Some(capture) = Self::take(&self.capture) {
            capture.release();
            info!("🎤 Live capture released");
        }
        if let Some(outbound) = Self::take(&self.outbound) {
            let _ = outbound.send(LiveOutbound::Close);
        }
    }
}

/// Rates and session parameters the driver needs.
#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub handshake_timeout: Duration,
}

impl LiveSessionConfig {
    pub fn from_settings(audio: &AudioSettings, live: &LiveSettings) -> Self {
        Self {
            input_sample_rate: audio.input_sample_rate,
            output_sample_rate: audio.output_sample_rate,
            model: live.model.clone(),
            voice: live.voice.clone(),
            system_instruction: live.system_instruction.clone(),
            handshake_timeout: live.handshake_timeout(),
        }
    }
}

pub struct LiveDriver {
    transport: Arc<dyn LiveTransport>,
    microphone: Arc<dyn Microphone>,
    config: LiveSessionConfig,
    events: Arc<dyn DriverEvents>,
    gate: Arc<SessionGate>,
    resources: Arc<SessionResources>,
    reader: Option<JoinHandle<()>>,
}

impl LiveDriver {
    pub fn new(
        transport: Arc<dyn LiveTransport>,
        microphone: Arc<dyn Microphone>,
        config: LiveSessionConfig,
        events: Arc<dyn DriverEvents>,
    ) -> Self {
        Self {
            transport,
            microphone,
            config,
            events,
            gate: Arc::new(SessionGate::default()),
            resources: Arc::new(SessionResources::default()),
            reader: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.gate.state()
    }

    pub fn is_connected(&self) -> bool {
        self.gate.state() == SessionState::Open
    }

    /// Open the microphone, establish the session and wait for the remote to
    /// confirm it. Audio starts flowing only after `Open` has been reported.
    pub async fn connect(&mut self, api_key: String, cancel: &CancelFlag) -> VoiceResult<()> {
        if !self.gate.begin_connect() {
            return Err(VoiceError::Protocol("Live session already in progress".to_string()));
        }

        match self.establish(api_key, cancel).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.gate.begin_close();
                self.resources.release();
                self.gate.mark_disconnected();
                Err(e)
            }
        }
    }

    async fn establish(&mut self, api_key: String, cancel: &CancelFlag) -> VoiceResult<()> {
        let capture = self.microphone.open().await?;
        let granted_rate = capture.sample_rate;
        let mut frames = capture.frames;
        SessionResources::put(&self.resources.capture, capture.handle);
        cancel.check("Live connect")?;

        let setup = LiveSetup {
            api_key,
            model: self.config.model.clone(),
            voice: self.config.voice.clone(),
            system_instruction: self.config.system_instruction.clone(),
        };
        let LiveConnection { outbound, mut inbound } = self.transport.connect(setup).await?;
        SessionResources::put(&self.resources.outbound, outbound);

        let opened = tokio::select! {
            result = tokio::time::timeout(self.config.handshake_timeout, wait_for_open(&mut inbound)) => {
                result.map_err(|_| VoiceError::Timeout(format!(
                    "Live session not confirmed within {:?}",
                    self.config.handshake_timeout
                )))?
            }
            _ = cancel.cancelled() => Err(VoiceError::Cancelled("Live connect".to_string())),
            closed = discard_frames(&mut frames) => closed,
        };
        opened?;

        if !self.gate.mark_open() {
            return Err(VoiceError::Cancelled("Live session closed during handshake".to_string()));
        }
        let opened_at = Instant::now();
        info!("✅ Live session open");
        self.events.on_phase(DriverPhase::Open);

        let pump = tokio::spawn(pump_capture(
            frames,
            opened_at,
            granted_rate,
            self.config.input_sample_rate,
            self.gate.clone(),
            self.resources.clone(),
        ));
        SessionResources::put(&self.resources.pump, pump);

        self.reader = Some(tokio::spawn(handle_inbound(
            inbound,
            self.config.output_sample_rate,
            self.gate.clone(),
            self.resources.clone(),
            self.events.clone(),
        )));
        Ok(())
    }

    /// Close the session and release every resource. Safe to call repeatedly
    /// and from any state.
    pub async fn disconnect(&mut self) {
        let initiated = self.gate.begin_close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.resources.release();
        self.gate.mark_disconnected();
        if initiated {
            info!("🔌 Live session disconnected");
        }
    }
}

impl Drop for LiveDriver {
    fn drop(&mut self) {
        self.gate.begin_close();
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.resources.release();
        self.gate.mark_disconnected();
    }
}

async fn wait_for_open(inbound: &mut mpsc::UnboundedReceiver<LiveInbound>) -> VoiceResult<()> {
    while let Some(event) = inbound.recv().await {
        match event {
            LiveInbound::Open => return Ok(()),
            LiveInbound::Closed(reason) => {
                return Err(VoiceError::Network(format!(
                    "Live session closed during handshake{}",
                    reason.map(|r| format!(": {}", r)).unwrap_or_default()
                )));
            }
            LiveInbound::Error(e) => return Err(e),
            other => debug!("Live: ignoring {:?} before open", other),
        }
    }
    Err(VoiceError::Network("Live transport ended during handshake".to_string()))
}

/// Drop frames while the handshake is pending. Only returns if the
/// microphone goes away.
async fn discard_frames(frames: &mut mpsc::UnboundedReceiver<AudioFrame>) -> VoiceResult<()> {
    let mut dropped = 0usize;
    while frames.recv().await.is_some() {
        dropped += 1;
        if dropped == 1 {
            debug!("Live: discarding capture until the session opens");
        }
    }
    Err(VoiceError::Device("microphone closed during Live handshake".to_string()))
}

/// Forward frames captured after `opened_at` while the gate is open.
async fn pump_capture(
    mut frames: mpsc::UnboundedReceiver<AudioFrame>,
    opened_at: Instant,
    granted_rate: u32,
    target_rate: u32,
    gate: Arc<SessionGate>,
    resources: Arc<SessionResources>,
) {
    let Some(outbound) = resources.outbound() else {
        return;
    };
    let mut warned = false;
    while let Some(frame) = frames.recv().await {
        if frame.captured_at <= opened_at {
            continue;
        }
        let (samples, rate) = if frame.sample_rate > target_rate {
            (resample(&frame.samples, frame.sample_rate, target_rate), target_rate)
        } else {
            if frame.sample_rate < target_rate && !warned {
                warn!(
                    "🎤 Capture at {}Hz is below {}Hz; sending at the native rate",
                    frame.sample_rate, target_rate
                );
                warned = true;
            }
            (frame.samples, frame.sample_rate)
        };
        let chunk = MediaChunk::from_samples(&samples, rate);
        let sent = gate.send_if_open(|| outbound.send(LiveOutbound::Media(chunk)).is_ok());
        if !sent {
            debug!("Live: gate closed, capture pump stopping");
            break;
        }
    }
    debug!("Live: capture pump finished ({}Hz source)", granted_rate);
}

async fn handle_inbound(
    mut inbound: mpsc::UnboundedReceiver<LiveInbound>,
    output_rate: u32,
    gate: Arc<SessionGate>,
    resources: Arc<SessionResources>,
    events: Arc<dyn DriverEvents>,
) {
    while let Some(event) = inbound.recv().await {
        match event {
            LiveInbound::Audio(data) => {
                match base64_decode(&data).and_then(|bytes| pcm16_to_float(&bytes, output_rate, 1)) {
                    Ok(buffer) => events.on_audio(buffer),
                    Err(e) => warn!("Live: skipping undecodable audio chunk: {}", e),
                }
            }
            LiveInbound::Transcript { role, text } => {
                events.on_transcript(TranscriptEvent::new(role, text, false));
            }
            LiveInbound::TurnComplete => debug!("Live: model turn complete"),
            LiveInbound::Open => debug!("Live: duplicate open ignored"),
            LiveInbound::Closed(reason) => {
                info!("🔌 Live session closed by remote: {}", reason.as_deref().unwrap_or("no reason"));
                close_from_remote(&gate, &resources);
                events.on_close();
                return;
            }
            LiveInbound::Error(e) => {
                warn!("Live session error: {}", e);
                // Stop sends first, then release.
                close_from_remote(&gate, &resources);
                events.on_error(e);
                return;
            }
        }
    }
    close_from_remote(&gate, &resources);
    events.on_close();
}

fn close_from_remote(gate: &SessionGate, resources: &SessionResources) {
    gate.begin_close();
    resources.release();
    gate.mark_disconnected();
}
