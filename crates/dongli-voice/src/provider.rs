//! HTTP client for the hosted task API shared by transcription and synthesis.
//!
//! Endpoints (relative to the configured base URL):
//! - `GET  /v1/models` (availability probe)
//! - `POST /v1/audio/transcriptions` (synchronous multipart transcription)
//! - `POST /v1/tasks/generations` (create an asynchronous task, returns `{id}`)
//! - `GET  /v1/tasks/generations/{id}` (poll `{status, output, error}`)

use crate::config::ProviderSettings;
use crate::error::{VoiceError, VoiceResult};
use crate::task::{await_task, CancelFlag, RetryPolicy, StreamingTask, TaskPoll};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
struct CreatedTask {
    id: String,
}

#[derive(Debug, Clone)]
pub struct TaskApiClient {
    base_url: String,
    api_key: Option<String>,
    poll_policy: RetryPolicy,
    client: reqwest::Client,
}

impl TaskApiClient {
    pub fn new(settings: &ProviderSettings) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone().filter(|k| !k.trim().is_empty()),
            poll_policy: settings.poll_policy(),
            client,
        })
    }

    pub fn with_poll_policy(mut self, policy: RetryPolicy) -> Self {
        self.poll_policy = policy;
        self
    }

    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn api_key(&self) -> VoiceResult<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| VoiceError::Configuration("provider API key is not configured".to_string()))
    }

    /// True when the model listing answers 2xx. Never errors.
    pub async fn probe(&self) -> bool {
        let Ok(key) = self.api_key() else {
            debug!("provider probe skipped: no API key");
            return false;
        };
        match self.client.get(self.url("/v1/models")).bearer_auth(key).send().await {
            Ok(res) => res.status().is_success(),
            Err(e) => {
                debug!("provider probe failed: {}", e);
                false
            }
        }
    }

    pub async fn create_task(&self, label: &'static str, body: &Value) -> VoiceResult<StreamingTask> {
        let res = self
            .client
            .post(self.url("/v1/tasks/generations"))
            .bearer_auth(self.api_key()?)
            .json(body)
            .send()
            .await?;
        let res = ensure_success(res, "task creation").await?;
        let created: CreatedTask = res.json().await?;
        info!("📨 {} task created: {}", label, created.id);
        Ok(StreamingTask::new(created.id, label))
    }

    pub async fn poll_task(&self, id: &str) -> VoiceResult<TaskPoll<Value>> {
        let res = self
            .client
            .get(self.url(&format!("/v1/tasks/generations/{}", id)))
            .bearer_auth(self.api_key()?)
            .send()
            .await?;
        let res = ensure_success(res, "task polling").await?;
        Ok(res.json().await?)
    }

    /// Poll until the task completes; returns its `output` object.
    pub async fn wait(&self, task: &StreamingTask, cancel: &CancelFlag) -> VoiceResult<Value> {
        await_task(task, &self.poll_policy, cancel, |id| async move { self.poll_task(&id).await }).await
    }
}

/// Turn a non-2xx response into a `Network` error carrying status and body.
pub async fn ensure_success(res: reqwest::Response, what: &str) -> VoiceResult<reqwest::Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().await.unwrap_or_default();
    Err(VoiceError::Network(format!("{} failed: {} {}", what, status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_a_configuration_error() {
        let client = TaskApiClient::new(&ProviderSettings::default()).unwrap();
        assert!(!client.has_credentials());
        assert!(matches!(client.api_key(), Err(VoiceError::Configuration(_))));
    }

    #[tokio::test]
    async fn probe_without_key_is_false() {
        let client = TaskApiClient::new(&ProviderSettings::default()).unwrap();
        assert!(!client.probe().await);
    }

    #[test]
    fn urls_are_joined_without_double_slash() {
        let settings = ProviderSettings {
            base_url: "http://localhost:9/api/".to_string(),
            ..ProviderSettings::default()
        };
        let client = TaskApiClient::new(&settings).unwrap();
        assert_eq!(client.url("/v1/models"), "http://localhost:9/api/v1/models");
    }
}
