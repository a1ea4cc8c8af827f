//! Audio codec utilities: PCM16 conversion, resampling, WAV framing and base64.
//!
//! Everything here is a pure function. Samples are mono f32 in `[-1.0, 1.0]`
//! unless stated otherwise; the wire format is 16-bit signed little-endian PCM.

use crate::audio::AudioBuffer;
use crate::error::{VoiceError, VoiceResult};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Size of the canonical RIFF/WAVE header written by [`encode_wav`].
pub const WAV_HEADER_LEN: usize = 44;

/// Convert float samples to PCM16.
///
/// Each sample is clamped to `[-1, 1]`, scaled by 32767 when positive and
/// 32768 when negative, then truncated toward zero.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = s.clamp(-1.0, 1.0);
            if s < 0.0 {
                (s * 32768.0) as i16
            } else {
                (s * 32767.0) as i16
            }
        })
        .collect()
}

/// Serialize PCM16 samples as little-endian bytes.
pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Decode interleaved little-endian PCM16 into a playable buffer.
///
/// Fails with [`VoiceError::Decode`] when the byte length is not a multiple of
/// `2 * channels`.
pub fn pcm16_to_float(bytes: &[u8], sample_rate: u32, channels: u16) -> VoiceResult<AudioBuffer> {
    if channels == 0 {
        return Err(VoiceError::Decode("channel count must be at least 1".to_string()));
    }
    let frame_bytes = 2 * channels as usize;
    if bytes.len() % frame_bytes != 0 {
        return Err(VoiceError::Decode(format!(
            "PCM16 payload of {} bytes is not a multiple of {} ({} channel(s))",
            bytes.len(),
            frame_bytes,
            channels
        )));
    }

    let frames = bytes.len() / frame_bytes;
    let mut data = vec![Vec::with_capacity(frames); channels as usize];
    for frame in bytes.chunks_exact(frame_bytes) {
        for (channel, sample) in frame.chunks_exact(2).enumerate() {
            let value = i16::from_le_bytes([sample[0], sample[1]]);
            data[channel].push(value as f32 / 32768.0);
        }
    }

    Ok(AudioBuffer::from_channels(sample_rate, data))
}

/// Linear-interpolation resampler.
///
/// Downsampling only: when `input_rate < output_rate` the input is returned
/// unchanged and the caller must keep labelling it with `input_rate`. Output
/// length is `round(len / ratio)`; reads past the end clamp to the last sample.
pub fn resample(samples: &[f32], input_rate: u32, output_rate: u32) -> Vec<f32> {
    if input_rate == output_rate || input_rate < output_rate || output_rate == 0 {
        return samples.to_vec();
    }
    if samples.is_empty() {
        return Vec::new();
    }

    let ratio = input_rate as f64 / output_rate as f64;
    let new_len = (samples.len() as f64 / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..new_len)
        .map(|i| {
            let position = i as f64 * ratio;
            let index1 = (position.floor() as usize).min(last);
            let index2 = (position.ceil() as usize).min(last);
            let fraction = (position - position.floor()) as f32;
            let val1 = samples[index1];
            let val2 = samples[index2];
            val1 + (val2 - val1) * fraction
        })
        .collect()
}

/// Encode mono float samples as a standalone 16-bit PCM WAV file.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data_len = (samples.len() * 2) as u32;

    let mut buf = Vec::with_capacity(WAV_HEADER_LEN + data_len as usize);
    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&(36 + data_len).to_le_bytes());
    buf.extend_from_slice(b"WAVE");
    // fmt subchunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&1u16.to_le_bytes()); // mono
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    buf.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
    buf.extend_from_slice(&2u16.to_le_bytes()); // block align
    buf.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    // data subchunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_len.to_le_bytes());
    buf.extend_from_slice(&pcm16_to_bytes(&float_to_pcm16(samples)));
    buf
}

pub fn base64_encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn base64_decode(data: &str) -> VoiceResult<Vec<u8>> {
    Ok(STANDARD.decode(data.trim())?)
}

/// One outbound realtime media chunk: base64 PCM16 plus its MIME tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

impl MediaChunk {
    /// Frame float samples as `audio/pcm;rate=<N>` base64 PCM16.
    pub fn from_samples(samples: &[f32], sample_rate: u32) -> Self {
        let bytes = pcm16_to_bytes(&float_to_pcm16(samples));
        Self {
            data: base64_encode(&bytes),
            mime_type: pcm_mime_type(sample_rate),
        }
    }
}

pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}
