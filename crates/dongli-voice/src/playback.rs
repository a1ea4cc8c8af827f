//! Gapless playback scheduling, compressed-clip decoding and the rodio output.
//!
//! Streaming replies arrive as independent clips. Each clip is scheduled at
//! `max(now, end of previous clip)` on a monotonic clock so consecutive clips
//! neither overlap nor leave gaps.

use crate::audio::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Assigns start offsets to clips on a single playback timeline.
#[derive(Debug, Clone, Default)]
pub struct PlaybackScheduler {
    next_start: Duration,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start offset for a clip of `length` given the current clock reading.
    pub fn schedule(&mut self, now: Duration, length: Duration) -> Duration {
        let start = now.max(self.next_start);
        self.next_start = start + length;
        start
    }

    /// Set `buffer.start_at` and advance the timeline.
    pub fn place(&mut self, now: Duration, buffer: &mut AudioBuffer) -> Duration {
        let start = self.schedule(now, buffer.duration());
        buffer.start_at = Some(start);
        start
    }

    /// End of the last scheduled clip.
    pub fn horizon(&self) -> Duration {
        self.next_start
    }
}

/// Monotonic clock that playback offsets are measured against.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackClock {
    origin: Instant,
}

impl PlaybackClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

impl Default for PlaybackClock {
    fn default() -> Self {
        Self::start()
    }
}

/// Decode a compressed clip (MP3, WAV, ...) into an [`AudioBuffer`].
pub fn decode_clip(bytes: &[u8]) -> VoiceResult<AudioBuffer> {
    if bytes.is_empty() {
        return Err(VoiceError::Decode("empty audio clip".to_string()));
    }
    let decoder = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
        .map_err(|e| VoiceError::Decode(format!("Decode failed: {}", e)))?;
    let channels = decoder.channels();
    let sample_rate = decoder.sample_rate();
    let samples: Vec<f32> = decoder.convert_samples::<f32>().collect();
    debug!("decoded clip: {} samples @ {}Hz x{}", samples.len(), sample_rate, channels);
    Ok(AudioBuffer::from_interleaved(sample_rate, channels, &samples))
}

/// Plays [`AudioBuffer`]s on the default output device.
///
/// Buffers are queued back to back. When a buffer's `start_at` lies beyond
/// the end of what has been queued so far, the difference is filled with
/// silence so the device timeline follows the scheduler's.
pub struct VoiceOutput {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Arc<Sink>,
    queued_until: Option<Duration>,
}

impl VoiceOutput {
    /// Create a new VoiceOutput (default output device).
    pub fn new() -> VoiceResult<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("🔊 VoiceOutput: sink ready");
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink: Arc::new(sink),
            queued_until: None,
        })
    }

    pub fn play(&mut self, buffer: &AudioBuffer) {
        if buffer.is_empty() {
            return;
        }
        if self.sink.empty() {
            self.queued_until = None;
        }
        if let (Some(start), Some(queued)) = (buffer.start_at, self.queued_until) {
            if start > queued {
                self.play_silence(start - queued);
            }
        }
        let channels = buffer.channel_count().max(1) as u16;
        self.sink.append(rodio::buffer::SamplesBuffer::new(
            channels,
            buffer.sample_rate,
            buffer.interleaved(),
        ));
        let end = buffer.start_at.unwrap_or_default() + buffer.duration();
        self.queued_until = Some(self.queued_until.map_or(end, |q| q.max(end)));
    }

    /// Queue a stretch of silence.
    pub fn play_silence(&self, duration: Duration) {
        let source = rodio::source::Zero::<f32>::new(1, 24000)
            .take_duration(duration)
            .convert_samples::<f32>();
        self.sink.append(source);
    }

    /// Stop playback immediately and clear the queue.
    pub fn stop(&mut self) {
        self.sink.stop();
        self.queued_until = None;
        info!("⏹️ VoiceOutput: stopped");
    }

    pub fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    /// Block until all currently queued audio has finished.
    pub fn sleep_until_end(&self) {
        self.sink.sleep_until_end();
    }
}
