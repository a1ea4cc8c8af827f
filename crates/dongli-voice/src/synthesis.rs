//! Text-to-speech via the hosted task API.

use crate::audio::AudioBuffer;
use crate::codec::base64_decode;
use crate::config::ProviderSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::playback::decode_clip;
use crate::provider::{ensure_success, TaskApiClient};
use crate::task::CancelFlag;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub voice: String,
    pub speed: f32,
}

/// Where the synthesized clip lives.
#[derive(Debug, Clone, PartialEq)]
pub enum SynthesizedAudio {
    Remote { url: String, duration: Option<f64> },
    Inline { bytes: Vec<u8>, duration: Option<f64> },
}

#[derive(Debug, Deserialize)]
struct SynthesisOutput {
    audio_url: Option<String>,
    audio_data: Option<String>,
    duration: Option<f64>,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn is_available(&self) -> bool;

    async fn synthesize(&self, request: &SpeechRequest, cancel: &CancelFlag) -> VoiceResult<SynthesizedAudio>;

    /// Download a remote clip.
    async fn fetch(&self, url: &str) -> VoiceResult<Vec<u8>>;

    /// Resolve either output form into a decoded buffer.
    async fn render(&self, audio: SynthesizedAudio) -> VoiceResult<AudioBuffer> {
        let bytes = match audio {
            SynthesizedAudio::Remote { url, .. } => self.fetch(&url).await?,
            SynthesizedAudio::Inline { bytes, .. } => bytes,
        };
        decode_clip(&bytes)
    }
}

#[derive(Debug, Clone)]
pub struct TaskSpeechSynthesizer {
    api: TaskApiClient,
    model: String,
}

impl TaskSpeechSynthesizer {
    pub fn new(settings: &ProviderSettings) -> VoiceResult<Self> {
        Ok(Self {
            api: TaskApiClient::new(settings)?,
            model: settings.synthesis_model.clone(),
        })
    }

    pub fn with_client(api: TaskApiClient, model: impl Into<String>) -> Self {
        Self {
            api,
            model: model.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for TaskSpeechSynthesizer {
    async fn is_available(&self) -> bool {
        self.api.probe().await
    }

    async fn synthesize(&self, request: &SpeechRequest, cancel: &CancelFlag) -> VoiceResult<SynthesizedAudio> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(VoiceError::Configuration("text is required for synthesis".to_string()));
        }
        let body = json!({
            "model": self.model,
            "input": {
                "text": text,
                "voice": request.voice,
                "speed": request.speed,
            }
        });
        let task = self.api.create_task("synthesis", &body).await?;
        let output: SynthesisOutput = serde_json::from_value(self.api.wait(&task, cancel).await?)?;
        info!("🗣️ Synthesis task {} finished", task.id);

        match (output.audio_url, output.audio_data) {
            (Some(url), _) => Ok(SynthesizedAudio::Remote {
                url,
                duration: output.duration,
            }),
            (None, Some(data)) => Ok(SynthesizedAudio::Inline {
                bytes: base64_decode(&data)?,
                duration: output.duration,
            }),
            (None, None) => Err(VoiceError::Protocol(format!(
                "synthesis task {} completed without audio output",
                task.id
            ))),
        }
    }

    async fn fetch(&self, url: &str) -> VoiceResult<Vec<u8>> {
        let res = self.api.http().get(url).send().await?;
        let res = ensure_success(res, "audio download").await?;
        Ok(res.bytes().await?.to_vec())
    }
}
