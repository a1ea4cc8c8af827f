//! Error types for the Dongli voice system

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice orchestration system.
///
/// The variants follow the failure classes the orchestrator reacts to: a
/// failure inside one driver is turned into "try the next driver", a
/// per-chunk `Decode` failure only drops that chunk.
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Microphone access refused or no capture device granted.
    #[error("Permission error: {0}")]
    Permission(String),

    /// Audio device / context initialisation failed.
    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Malformed audio payload. Callers drop the chunk and keep the stream.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Poll budget or handshake deadline exhausted.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Missing credential or URL; the driver is skipped without being attempted.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Every audio strategy failed or was skipped.
    #[error("All voice services unavailable: {0}")]
    Exhausted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// Whether retrying the same user action can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            VoiceError::Permission(_)
                | VoiceError::Device(_)
                | VoiceError::Network(_)
                | VoiceError::Timeout(_)
                | VoiceError::Decode(_)
                | VoiceError::Playback(_)
                | VoiceError::Io(_)
        )
    }

    /// Short machine-friendly name of the failure class (used in logs and status lines).
    pub fn kind(&self) -> &'static str {
        match self {
            VoiceError::Permission(_) => "permission",
            VoiceError::Device(_) => "device",
            VoiceError::Network(_) => "network",
            VoiceError::Protocol(_) => "protocol",
            VoiceError::Decode(_) => "decode",
            VoiceError::Timeout(_) => "timeout",
            VoiceError::Configuration(_) => "configuration",
            VoiceError::Playback(_) => "playback",
            VoiceError::Cancelled(_) => "cancelled",
            VoiceError::Exhausted(_) => "exhausted",
            VoiceError::Io(_) => "io",
        }
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::DeviceNotAvailable => {
                VoiceError::Permission("input device not available".to_string())
            }
            other => VoiceError::Device(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::Permission("input device not available".to_string())
            }
            other => VoiceError::Device(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Device(err.to_string())
    }
}

impl From<reqwest::Error> for VoiceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            VoiceError::Timeout(err.to_string())
        } else if err.is_decode() {
            VoiceError::Protocol(err.to_string())
        } else {
            VoiceError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Protocol(p) => VoiceError::Protocol(p.to_string()),
            WsError::Http(resp) => {
                VoiceError::Protocol(format!("handshake rejected with HTTP {}", resp.status()))
            }
            other => VoiceError::Network(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for VoiceError {
    fn from(err: serde_json::Error) -> Self {
        VoiceError::Protocol(err.to_string())
    }
}

impl From<base64::DecodeError> for VoiceError {
    fn from(err: base64::DecodeError) -> Self {
        VoiceError::Decode(err.to_string())
    }
}

impl From<config::ConfigError> for VoiceError {
    fn from(err: config::ConfigError) -> Self {
        VoiceError::Configuration(err.to_string())
    }
}
