//! Speech-to-text: sealed utterance in, text out.
//!
//! Short utterances go through the synchronous multipart endpoint; longer ones
//! are submitted as an asynchronous task and polled.

use crate::codec::base64_encode;
use crate::config::ProviderSettings;
use crate::error::VoiceResult;
use crate::provider::{ensure_success, TaskApiClient};
use crate::task::CancelFlag;
use crate::utterance::SealedUtterance;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Transcription {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub duration: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
pub struct TranscriptionRequest<'a> {
    pub audio: &'a SealedUtterance,
    pub language: &'a str,
    pub prompt: Option<&'a str>,
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Whether the service is reachable with the configured credentials. Never errors.
    async fn is_available(&self) -> bool;

    /// Bounded-duration request answered in one round trip.
    async fn transcribe_sync(&self, request: TranscriptionRequest<'_>) -> VoiceResult<Transcription>;

    /// Submit a task and poll it; stops early when `cancel` is set.
    async fn transcribe_async(
        &self,
        request: TranscriptionRequest<'_>,
        cancel: &CancelFlag,
    ) -> VoiceResult<Transcription>;
}

/// Whisper over the hosted task API.
#[derive(Debug, Clone)]
pub struct WhisperTranscriber {
    api: TaskApiClient,
    model: String,
}

impl WhisperTranscriber {
    pub fn new(settings: &ProviderSettings) -> VoiceResult<Self> {
        Ok(Self {
            api: TaskApiClient::new(settings)?,
            model: settings.transcription_model.clone(),
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
impl Transcriber for WhisperTranscriber {
    async fn is_available(&self) -> bool {
        self.api.probe().await
    }

    async fn transcribe_sync(&self, request: TranscriptionRequest<'_>) -> VoiceResult<Transcription> {
        let audio = request.audio;
        let file_name = format!("audio.{}", audio.format.tag());
        let part = reqwest::multipart::Part::bytes(audio.data.clone())
            .file_name(file_name)
            .mime_str(&audio.format.mime_type())?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        if !request.language.is_empty() {
            form = form.text("language", request.language.to_string());
        }
        if let Some(prompt) = request.prompt {
            form = form.text("prompt", prompt.to_string());
        }

        let res = self
            .api
            .http()
            .post(self.api.url("/v1/audio/transcriptions"))
            .bearer_auth(self.api.api_key()?)
            .multipart(form)
            .send()
            .await?;
        let res = ensure_success(res, "transcription").await?;
        let transcription: Transcription = res.json().await?;
        info!("📝 Transcribed {:?} -> {} chars", audio.duration, transcription.text.chars().count());
        Ok(transcription)
    }

    async fn transcribe_async(
        &self,
        request: TranscriptionRequest<'_>,
        cancel: &CancelFlag,
    ) -> VoiceResult<Transcription> {
        let body = json!({
            "model": self.model,
            "input": {
                "audio": base64_encode(&request.audio.data),
                "language": request.language,
                "prompt": request.prompt,
            }
        });
        let task = self.api.create_task("transcription", &body).await?;
        let output = self.api.wait(&task, cancel).await?;
        let transcription: Transcription = serde_json::from_value(output)?;
        info!("📝 Transcription task {} finished", task.id);
        Ok(transcription)
    }
}
