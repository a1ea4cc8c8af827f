//! Half-duplex Qwen relay driver.
//!
//! The utterance is posted to a local relay that streams the model's reply
//! back as server-sent events. Text deltas are forwarded immediately; audio
//! deltas are decoded and scheduled back to back on one playback clock.

use crate::audio::Microphone;
use crate::codec::{base64_decode, base64_encode};
use crate::config::{AudioSettings, RelaySettings};
use crate::error::{VoiceError, VoiceResult};
use crate::events::{DriverEvents, DriverPhase, Role, TranscriptEvent};
use crate::playback::{decode_clip, PlaybackClock, PlaybackScheduler};
use crate::provider::ensure_success;
use crate::task::CancelFlag;
use crate::utterance::{UtteranceFormat, UtteranceRecorder};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Chunked response body.
pub type ByteStream = BoxStream<'static, VoiceResult<Bytes>>;

// Request body

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayRequest {
    pub messages: Vec<RelayMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayMessage {
    pub role: &'static str,
    pub content: Vec<RelayContent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub audio: RelayAudio,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelayAudio {
    pub format: String,
    pub sample_rate: u32,
    pub data: String,
}

impl RelayRequest {
    /// Single user message carrying one audio utterance.
    pub fn audio(format: impl Into<String>, sample_rate: u32, data: String) -> Self {
        Self {
            messages: vec![RelayMessage {
                role: "user",
                content: vec![RelayContent {
                    kind: "audio",
                    audio: RelayAudio {
                        format: format.into(),
                        sample_rate,
                        data,
                    },
                }],
            }],
        }
    }
}

// Stream frames

#[derive(Debug, Default, Deserialize)]
pub struct RelayFrame {
    #[serde(default)]
    pub choices: Vec<RelayChoice>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayChoice {
    #[serde(default)]
    pub delta: RelayDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayDelta {
    pub content: Option<String>,
    pub audio: Option<RelayAudioDelta>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RelayAudioDelta {
    pub data: Option<String>,
}

impl RelayFrame {
    fn delta(&self) -> Option<&RelayDelta> {
        self.choices.first().map(|c| &c.delta)
    }
}

/// One parsed SSE line.
#[derive(Debug)]
pub enum SseLine {
    Frame(RelayFrame),
    Done,
    /// Blank, comment or non-data line.
    Ignored,
}

pub fn parse_sse_line(line: &str) -> VoiceResult<SseLine> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(SseLine::Ignored);
    }
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Ignored);
    };
    let data = data.trim_start();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    Ok(SseLine::Frame(serde_json::from_str(data)?))
}

/// Reassembles lines across arbitrary read boundaries.
///
/// Bytes are buffered (not strings) so a multi-byte character split between
/// two reads is decoded intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk; return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline_pos) = self.pending.iter().position(|&b| b == b'\n') {
            let rest = self.pending.split_off(newline_pos + 1);
            let mut line = std::mem::replace(&mut self.pending, rest);
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&std::mem::take(&mut self.pending)).into_owned();
        Some(line.trim_end_matches('\r').to_string())
    }
}

#[async_trait]
pub trait RelayClient: Send + Sync {
    /// Health probe. Never errors.
    async fn probe(&self) -> bool;

    /// Post the request and return the streaming body. Non-2xx is an error.
    async fn open_stream(&self, request: &RelayRequest) -> VoiceResult<ByteStream>;
}

#[derive(Debug, Clone)]
pub struct HttpRelayClient {
    backend_url: String,
    health_url: String,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl HttpRelayClient {
    pub fn new(settings: &RelaySettings) -> VoiceResult<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            backend_url: settings.backend_url.clone(),
            health_url: settings.health_url(),
            probe_timeout: Duration::from_millis(settings.probe_timeout_ms),
            client,
        })
    }
}

#[async_trait]
impl RelayClient for HttpRelayClient {
    async fn probe(&self) -> bool {
        if self.backend_url.trim().is_empty() {
            return false;
        }
        match self
            .client
            .get(&self.health_url)
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("relay probe failed: {}", e);
                false
            }
        }
    }

    async fn open_stream(&self, request: &RelayRequest) -> VoiceResult<ByteStream> {
        let res = self.client.post(&self.backend_url).json(request).send().await?;
        let res = ensure_success(res, "relay request").await?;
        Ok(res.bytes_stream().map(|chunk| chunk.map_err(VoiceError::from)).boxed())
    }
}

/// Counters for one consumed reply stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    pub text_deltas: usize,
    pub audio_clips: usize,
    pub skipped: usize,
}

/// Consume a reply stream: text deltas become model transcripts, audio
/// deltas are decoded and placed on `scheduler`. Malformed frames and
/// undecodable clips are skipped. Returns when the stream ends.
pub async fn consume_stream(
    mut stream: ByteStream,
    events: &dyn DriverEvents,
    scheduler: &mut PlaybackScheduler,
    clock: &PlaybackClock,
    cancel: &CancelFlag,
) -> VoiceResult<StreamSummary> {
    let mut buffer = SseLineBuffer::new();
    let mut summary = StreamSummary::default();

    loop {
        let next = tokio::select! {
            next = stream.next() => next,
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled("relay stream".to_string())),
        };
        let Some(chunk) = next else { break };
        for line in buffer.push(&chunk?) {
            handle_line(&line, events, scheduler, clock, &mut summary);
        }
    }
    if let Some(line) = buffer.finish() {
        handle_line(&line, events, scheduler, clock, &mut summary);
    }
    Ok(summary)
}

fn handle_line(
    line: &str,
    events: &dyn DriverEvents,
    scheduler: &mut PlaybackScheduler,
    clock: &PlaybackClock,
    summary: &mut StreamSummary,
) {
    let frame = match parse_sse_line(line) {
        Ok(SseLine::Frame(frame)) => frame,
        Ok(SseLine::Done) => {
            debug!("relay: [DONE]");
            return;
        }
        Ok(SseLine::Ignored) => return,
        Err(e) => {
            warn!("relay: skipping malformed frame: {}", e);
            summary.skipped += 1;
            return;
        }
    };
    let Some(delta) = frame.delta() else {
        return;
    };
    if let Some(text) = delta.content.as_deref().filter(|t| !t.is_empty()) {
        events.on_transcript(TranscriptEvent::new(Role::Model, text, false));
        summary.text_deltas += 1;
    }
    if let Some(data) = delta.audio.as_ref().and_then(|a| a.data.as_deref()) {
        match base64_decode(data).and_then(|bytes| decode_clip(&bytes)) {
            Ok(mut clip) => {
                let start = scheduler.place(clock.now(), &mut clip);
                debug!("relay: clip of {:?} scheduled at {:?}", clip.duration(), start);
                events.on_audio(clip);
                summary.audio_clips += 1;
            }
            Err(e) => {
                warn!("relay: skipping undecodable audio chunk: {}", e);
                summary.skipped += 1;
            }
        }
    }
}

pub struct RelayDriver {
    recorder: UtteranceRecorder,
    client: Arc<dyn RelayClient>,
    events: Arc<dyn DriverEvents>,
    sample_rate: u32,
    format: String,
    scheduler: PlaybackScheduler,
    clock: PlaybackClock,
}

impl RelayDriver {
    pub fn new(
        microphone: Arc<dyn Microphone>,
        client: Arc<dyn RelayClient>,
        events: Arc<dyn DriverEvents>,
        audio: &AudioSettings,
        relay: &RelaySettings,
    ) -> Self {
        Self {
            recorder: UtteranceRecorder::new(microphone),
            client,
            events,
            sample_rate: audio.input_sample_rate,
            format: relay.format.clone(),
            scheduler: PlaybackScheduler::new(),
            clock: PlaybackClock::start(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_recording()
    }

    pub async fn start_recording(&mut self) -> VoiceResult<()> {
        self.recorder.start().await?;
        self.events.on_phase(DriverPhase::Recording);
        Ok(())
    }

    /// Seal the utterance, send it and consume the reply. `on_close` fires
    /// exactly once when the stream ends normally.
    pub async fn finish_turn(&mut self, cancel: &CancelFlag) -> VoiceResult<StreamSummary> {
        let utterance = self.recorder.stop().await?;
        self.events.on_phase(DriverPhase::Processing);

        let container = if self.format.eq_ignore_ascii_case("pcm") {
            UtteranceFormat::RawPcm {
                sample_rate: self.sample_rate,
            }
        } else {
            UtteranceFormat::Wav
        };
        let sealed = utterance.seal(self.sample_rate, container)?;
        let request = RelayRequest::audio(sealed.format.tag(), sealed.sample_rate, base64_encode(&sealed.data));

        info!("📡 Sending {:?} utterance to relay", sealed.duration);
        let stream = self.client.open_stream(&request).await?;
        let summary = consume_stream(stream, self.events.as_ref(), &mut self.scheduler, &self.clock, cancel).await?;
        info!(
            "📡 Relay reply finished: {} text deltas, {} clips, {} skipped",
            summary.text_deltas, summary.audio_clips, summary.skipped
        );
        self.events.on_close();
        Ok(summary)
    }

    pub fn cancel(&mut self) {
        self.recorder.cancel();
    }
}
