//! Audio capture using CPAL, plus the buffer types shared by every driver.
//!
//! The capture stream lives on a dedicated thread (cpal `Stream` is `!Send` on
//! some platforms). Callers only see a [`CaptureStream`]: the rate the device
//! actually granted, a channel of fixed-size frames and a [`CaptureHandle`]
//! that releases the device exactly once.

use crate::config::AudioSettings;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One block of mono samples delivered by the capture device.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Samples (f32, normalized to -1.0 to 1.0)
    pub samples: Vec<f32>,

    /// Rate the samples were captured at
    pub sample_rate: u32,

    /// Timestamp when captured
    pub captured_at: Instant,
}

/// Decoded, playable audio: one sample vector per channel.
///
/// `start_at` is filled in by the playback scheduler with the offset on the
/// driver's playback clock at which this buffer should start.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    channels: Vec<Vec<f32>>,
    pub start_at: Option<Duration>,
}

impl AudioBuffer {
    pub fn from_channels(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
            start_at: None,
        }
    }

    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self::from_channels(sample_rate, vec![samples])
    }

    /// Split interleaved samples into channels.
    pub fn from_interleaved(sample_rate: u32, channel_count: u16, samples: &[f32]) -> Self {
        let count = channel_count.max(1) as usize;
        let mut channels = vec![Vec::with_capacity(samples.len() / count); count];
        for frame in samples.chunks(count) {
            for (c, s) in frame.iter().enumerate() {
                channels[c].push(*s);
            }
        }
        Self::from_channels(sample_rate, channels)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        self.channels.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.frames() == 0
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Interleave channels back into a single sample vector for playback.
    pub fn interleaved(&self) -> Vec<f32> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * self.channel_count());
        for i in 0..frames {
            for channel in &self.channels {
                out.push(channel.get(i).copied().unwrap_or(0.0));
            }
        }
        out
    }
}

/// Releases a capture device. Safe to call any number of times; the release
/// action runs once. Dropping the handle releases as well.
pub struct CaptureHandle {
    release: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CaptureHandle {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Mutex::new(Some(Box::new(release))),
        }
    }

    pub fn release(&self) {
        let action = match self.release.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_released(&self) -> bool {
        match self.release.lock() {
            Ok(guard) => guard.is_none(),
            Err(poisoned) => poisoned.into_inner().is_none(),
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("released", &self.is_released())
            .finish()
    }
}

/// An open microphone. Frames stop arriving (the channel closes) once the
/// handle is released.
#[derive(Debug)]
pub struct CaptureStream {
    /// Rate the device granted; may differ from the one requested.
    pub sample_rate: u32,
    pub frames: mpsc::UnboundedReceiver<AudioFrame>,
    pub handle: CaptureHandle,
}

/// Source of microphone audio. Failing to open maps to
/// [`VoiceError::Permission`] when access is refused and
/// [`VoiceError::Device`] otherwise.
#[async_trait]
pub trait Microphone: Send + Sync {
    async fn open(&self) -> VoiceResult<CaptureStream>;
}

/// Default-host microphone via CPAL.
#[derive(Debug, Clone)]
pub struct CpalMicrophone {
    settings: AudioSettings,
}

impl CpalMicrophone {
    pub fn new(settings: AudioSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl Microphone for CpalMicrophone {
    async fn open(&self) -> VoiceResult<CaptureStream> {
        let (ready_tx, ready_rx) = oneshot::channel::<VoiceResult<u32>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let preferred_rate = self.settings.input_sample_rate;
        let block = self.settings.capture_block.max(1);

        // Capture lives in a dedicated thread (cpal Stream is !Send on some platforms)
        thread::Builder::new()
            .name("dongli-capture".to_string())
            .spawn(move || {
                let stream = match build_input_stream(preferred_rate, block, frame_tx) {
                    Ok((stream, granted)) => {
                        let _ = ready_tx.send(Ok(granted));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Blocks until the handle is released (or dropped).
                let _ = stop_rx.recv();
                drop(stream);
                info!("🎤 Audio capture stopped");
            })?;

        let sample_rate = ready_rx
            .await
            .map_err(|_| VoiceError::Device("capture thread exited before reporting".to_string()))??;

        Ok(CaptureStream {
            sample_rate,
            frames: frame_rx,
            handle: CaptureHandle::new(move || {
                let _ = stop_tx.send(());
            }),
        })
    }
}

fn build_input_stream(
    preferred_rate: u32,
    block: usize,
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
) -> VoiceResult<(Stream, u32)> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::Permission("No input device available".to_string()))?;

    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    // Prefer the requested rate; otherwise take whatever the device offers and
    // let the drivers downsample.
    let preferred = device
        .supported_input_configs()
        .map_err(|e| VoiceError::Device(e.to_string()))?
        .find(|range| {
            range.min_sample_rate().0 <= preferred_rate
                && range.max_sample_rate().0 >= preferred_rate
                && matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16)
        })
        .map(|range| range.with_sample_rate(cpal::SampleRate(preferred_rate)));
    let supported = match preferred {
        Some(config) => config,
        None => device.default_input_config()?,
    };

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let granted = config.sample_rate.0;
    let channels = config.channels.max(1) as usize;
    if granted != preferred_rate {
        warn!(
            "🎤 Device granted {}Hz instead of {}Hz; frames will be resampled",
            granted, preferred_rate
        );
    }
    info!("🎤 Initializing audio capture ({}Hz, {} channels)", granted, channels);

    let mut pending: Vec<f32> = Vec::with_capacity(block);
    let mut push = move |mono: &mut dyn Iterator<Item = f32>| {
        for sample in mono {
            pending.push(sample);
            if pending.len() >= block {
                let frame = AudioFrame {
                    samples: std::mem::replace(&mut pending, Vec::with_capacity(block)),
                    sample_rate: granted,
                    captured_at: Instant::now(),
                };
                if frame_tx.send(frame).is_err() {
                    debug!("capture receiver dropped");
                    return;
                }
            }
        }
    };
    let err_fn = |err: cpal::StreamError| warn!("Audio stream error: {}", err);

    let stream = match sample_format {
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let mut mono = data
                    .chunks(channels)
                    .map(|f| f.iter().map(|&s| s as f32 / 32768.0).sum::<f32>() / f.len() as f32);
                push(&mut mono);
            },
            err_fn,
            None,
        )?,
        _ => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mut mono = data
                    .chunks(channels)
                    .map(|f| f.iter().sum::<f32>() / f.len() as f32);
                push(&mut mono);
            },
            err_fn,
            None,
        )?,
    };

    stream.play()?;
    info!("✅ Audio capture started");
    Ok((stream, granted))
}
