//! Voice configuration loaded from defaults, an optional TOML file and the environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | DONGLI_VOICE_CONFIG | config/voice.toml | Path of the optional TOML file. |
//! | DONGLI__LIVE__API_KEYS | (empty) | Comma separated Live API keys, rotated round-robin. |
//! | DONGLI__LIVE__WS_URL | wss://generativelanguage.googleapis.com | Live WebSocket base. |
//! | DONGLI__PROVIDER__BASE_URL | https://router.shengsuanyun.com/api | Transcription / synthesis task API. |
//! | DONGLI__PROVIDER__API_KEY | (none, falls back to SHENGSUANYUN_API_KEY) | Bearer key for the task API. |
//! | DONGLI__RELAY__BACKEND_URL | http://localhost:3001/api/qwen-mini | Local Qwen relay endpoint. |

use crate::error::VoiceResult;
use crate::task::{Backoff, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const RELAY_PATH_SUFFIX: &str = "/api/qwen-mini";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub audio: AudioSettings,
    #[serde(default)]
    pub live: LiveSettings,
    #[serde(default)]
    pub provider: ProviderSettings,
    #[serde(default)]
    pub relay: RelaySettings,
}

/// Capture and playback formats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Rate sent upstream (Live media chunks, sealed utterances).
    pub input_sample_rate: u32,
    /// Rate of PCM16 returned by the Live session.
    pub output_sample_rate: u32,
    pub channels: u16,
    /// Samples per capture frame.
    pub capture_block: usize,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            channels: 1,
            capture_block: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveSettings {
    pub ws_url: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub handshake_timeout_ms: u64,
    pub api_keys: Vec<String>,
}

impl Default for LiveSettings {
    fn default() -> Self {
        Self {
            ws_url: "wss://generativelanguage.googleapis.com".to_string(),
            model: "google/gemini-2.5-flash-live".to_string(),
            voice: "Aoede".to_string(),
            system_instruction: "You are the village guide of Dongli Village. Always answer in Mandarin Chinese, warmly and briefly.".to_string(),
            handshake_timeout_ms: 15_000,
            api_keys: Vec::new(),
        }
    }
}

impl LiveSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Task API used for Whisper transcription and speech synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub transcription_model: String,
    pub synthesis_model: String,
    pub voice: String,
    pub speed: f32,
    pub language: String,
    pub prompt: Option<String>,
    /// Utterances at most this long use the synchronous transcription endpoint.
    pub sync_limit_ms: u64,
    pub poll_interval_ms: u64,
    pub poll_max_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            base_url: "https://router.shengsuanyun.com/api".to_string(),
            api_key: None,
            transcription_model: "whisper-1".to_string(),
            synthesis_model: "runway/eleven_multilingual_v2".to_string(),
            voice: "Clyde".to_string(),
            speed: 1.0,
            language: "zh".to_string(),
            prompt: Some("以下是普通话的句子，关于东里村的旅游咨询。".to_string()),
            sync_limit_ms: 10_000,
            poll_interval_ms: 1_000,
            poll_max_attempts: 30,
            request_timeout_secs: 60,
        }
    }
}

impl ProviderSettings {
    pub fn poll_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.poll_max_attempts,
            interval: Duration::from_millis(self.poll_interval_ms),
            backoff: Backoff::Fixed,
        }
    }

    pub fn sync_limit(&self) -> Duration {
        Duration::from_millis(self.sync_limit_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub backend_url: String,
    /// Container tag sent with each utterance.
    pub format: String,
    pub sample_rate: u32,
    pub probe_timeout_ms: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            backend_url: "http://localhost:3001/api/qwen-mini".to_string(),
            format: "wav".to_string(),
            sample_rate: 16000,
            probe_timeout_ms: 3_000,
        }
    }
}

impl RelaySettings {
    /// Health endpoint: the `/api/qwen-mini` suffix replaced by `/health`.
    pub fn health_url(&self) -> String {
        let base = self.backend_url.trim_end_matches('/');
        match base.strip_suffix(RELAY_PATH_SUFFIX) {
            Some(root) => format!("{}/health", root),
            None => format!("{}/health", base),
        }
    }
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env > `DONGLI_VOICE_CONFIG` file
    /// (default `config/voice.toml`) > defaults. Reads `.env` first.
    pub fn load() -> VoiceResult<Self> {
        let _ = dotenvy::dotenv();
        let config_path =
            std::env::var("DONGLI_VOICE_CONFIG").unwrap_or_else(|_| "config/voice.toml".to_string());
        Self::load_from(Path::new(&config_path))
    }

    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder().add_source(config::Config::try_from(&VoiceConfig::default())?);

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("DONGLI")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("live.api_keys")
                    .try_parsing(true),
            )
            .build()?;

        let mut cfg: VoiceConfig = built.try_deserialize()?;
        if cfg.provider.api_key.as_deref().map_or(true, str::is_empty) {
            cfg.provider.api_key = std::env::var("SHENGSUANYUN_API_KEY").ok().filter(|k| !k.trim().is_empty());
        }
        cfg.live.api_keys.retain(|k| !k.trim().is_empty());
        Ok(cfg)
    }
}
