//! Half-duplex utterance recording.
//!
//! An [`Utterance`] accumulates captured frames and is sealed exactly once
//! (sealing consumes it). [`UtteranceRecorder`] drives a [`Microphone`] for one
//! utterance at a time and hands back the sealed container.

use crate::audio::{AudioFrame, CaptureHandle, Microphone};
use crate::codec::{encode_wav, pcm16_to_bytes, float_to_pcm16, pcm_mime_type, resample};
use crate::error::{VoiceError, VoiceResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Container an utterance is sealed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtteranceFormat {
    /// Bare PCM16 little-endian.
    RawPcm { sample_rate: u32 },
    /// 16-bit PCM WAV.
    Wav,
    /// Codec-native container produced elsewhere (e.g. `audio/webm;codecs=opus`).
    Encoded { mime: String },
}

impl UtteranceFormat {
    pub fn mime_type(&self) -> String {
        match self {
            UtteranceFormat::RawPcm { sample_rate } => pcm_mime_type(*sample_rate),
            UtteranceFormat::Wav => "audio/wav".to_string(),
            UtteranceFormat::Encoded { mime } => mime.clone(),
        }
    }

    /// Short tag used in request bodies and upload file names (`pcm`, `wav`, `webm`).
    pub fn tag(&self) -> String {
        match self {
            UtteranceFormat::RawPcm { .. } => "pcm".to_string(),
            UtteranceFormat::Wav => "wav".to_string(),
            UtteranceFormat::Encoded { mime } => mime
                .split(';')
                .next()
                .and_then(|t| t.split('/').nth(1))
                .unwrap_or("bin")
                .to_string(),
        }
    }
}

/// A finished utterance ready for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedUtterance {
    pub data: Vec<u8>,
    pub format: UtteranceFormat,
    /// Rate actually encoded in `data`.
    pub sample_rate: u32,
    pub duration: Duration,
}

impl SealedUtterance {
    pub fn is_empty(&self) -> bool {
        self.duration.is_zero()
    }
}

/// Frames captured for one utterance, at the capture device's rate.
#[derive(Debug, Clone)]
pub struct Utterance {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl Utterance {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            samples: Vec::new(),
            sample_rate,
        }
    }

    pub fn push(&mut self, frame: &AudioFrame) {
        if frame.sample_rate != self.sample_rate {
            warn!(
                "dropping frame at {}Hz in a {}Hz utterance",
                frame.sample_rate, self.sample_rate
            );
            return;
        }
        self.samples.extend_from_slice(&frame.samples);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Resample to `target_rate` (downsampling only) and package as `format`.
    ///
    /// `Encoded` containers come from an external encoder; captured PCM cannot
    /// be sealed into one.
    pub fn seal(self, target_rate: u32, format: UtteranceFormat) -> VoiceResult<SealedUtterance> {
        let samples = resample(&self.samples, self.sample_rate, target_rate);
        let sample_rate = if self.sample_rate > target_rate {
            target_rate
        } else {
            self.sample_rate
        };
        let duration = if sample_rate == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(samples.len() as f64 / sample_rate as f64)
        };

        let (data, format) = match format {
            UtteranceFormat::Wav => (encode_wav(&samples, sample_rate), UtteranceFormat::Wav),
            UtteranceFormat::RawPcm { .. } => (
                pcm16_to_bytes(&float_to_pcm16(&samples)),
                UtteranceFormat::RawPcm { sample_rate },
            ),
            UtteranceFormat::Encoded { mime } => {
                return Err(VoiceError::Configuration(format!(
                    "captured PCM cannot be sealed as {}",
                    mime
                )));
            }
        };

        Ok(SealedUtterance {
            data,
            format,
            sample_rate,
            duration,
        })
    }
}

struct ActiveRecording {
    handle: CaptureHandle,
    collector: JoinHandle<Utterance>,
}

/// Records one utterance at a time from a [`Microphone`].
pub struct UtteranceRecorder {
    microphone: Arc<dyn Microphone>,
    active: Option<ActiveRecording>,
}

impl UtteranceRecorder {
    pub fn new(microphone: Arc<dyn Microphone>) -> Self {
        Self {
            microphone,
            active: None,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    /// Open the microphone and start collecting frames.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.active.is_some() {
            return Err(VoiceError::Protocol("a recording is already in progress".to_string()));
        }
        let capture = self.microphone.open().await?;
        let mut frames = capture.frames;
        let mut utterance = Utterance::new(capture.sample_rate);
        let collector = tokio::spawn(async move {
            while let Some(frame) = frames.recv().await {
                utterance.push(&frame);
            }
            utterance
        });
        info!("🎙️ Recording utterance ({}Hz)", capture.sample_rate);
        self.active = Some(ActiveRecording {
            handle: capture.handle,
            collector,
        });
        Ok(())
    }

    /// Release the microphone and return everything captured so far.
    pub async fn stop(&mut self) -> VoiceResult<Utterance> {
        let active = self
            .active
            .take()
            .ok_or_else(|| VoiceError::Protocol("no recording in progress".to_string()))?;
        active.handle.release();
        let utterance = active
            .collector
            .await
            .map_err(|e| VoiceError::Device(format!("capture collector failed: {}", e)))?;
        info!("🎙️ Recording stopped ({} samples)", utterance.len());
        Ok(utterance)
    }

    /// Release the microphone and discard the utterance. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(active) = self.active.take() {
            active.handle.release();
            active.collector.abort();
            info!("🎙️ Recording discarded");
        }
    }
}

impl Drop for UtteranceRecorder {
    fn drop(&mut self) {
        self.cancel();
    }
}
