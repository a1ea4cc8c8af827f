//! Transport for the full-duplex Live session.
//!
//! [`LiveTransport`] turns a session setup into a pair of channels: outbound
//! media chunks and inbound session events. [`GeminiLiveTransport`] speaks the
//! BidiGenerateContent WebSocket protocol; tests substitute an in-memory fake.

use crate::codec::MediaChunk;
use crate::error::{VoiceError, VoiceResult};
use crate::events::Role;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const BIDI_PATH: &str = "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Everything needed to open one session.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSetup {
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiveOutbound {
    Media(MediaChunk),
    Close,
}

#[derive(Debug)]
pub enum LiveInbound {
    /// Remote confirmed the session (setup complete).
    Open,
    /// Base64 PCM16 at the output rate.
    Audio(String),
    Transcript { role: Role, text: String },
    TurnComplete,
    Closed(Option<String>),
    Error(VoiceError),
}

/// Channels of an established connection. Dropping `outbound` closes the socket.
#[derive(Debug)]
pub struct LiveConnection {
    pub outbound: mpsc::UnboundedSender<LiveOutbound>,
    pub inbound: mpsc::UnboundedReceiver<LiveInbound>,
}

#[async_trait]
pub trait LiveTransport: Send + Sync {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<LiveConnection>;
}

// Wire types

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupFrame<'a> {
    setup: Setup<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Setup<'a> {
    model: String,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    input_audio_transcription: Empty,
    output_audio_transcription: Empty,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'a str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfigWire<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfigWire<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Debug, Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputFrame<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [&'a MediaChunk; 1],
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
struct InlineData {
    data: String,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    #[serde(default)]
    text: String,
}

/// Serialized setup frame for `setup`.
pub fn setup_frame(setup: &LiveSetup) -> VoiceResult<String> {
    let model = if setup.model.starts_with("models/") {
        setup.model.clone()
    } else {
        format!("models/{}", setup.model)
    };
    let frame = SetupFrame {
        setup: Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfigWire {
                        prebuilt_voice_config: PrebuiltVoice { voice_name: &setup.voice },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart { text: &setup.system_instruction }],
            },
            input_audio_transcription: Empty {},
            output_audio_transcription: Empty {},
        },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Serialized realtime-input frame carrying one media chunk.
pub fn media_frame(chunk: &MediaChunk) -> VoiceResult<String> {
    let frame = RealtimeInputFrame {
        realtime_input: RealtimeInput { media_chunks: [chunk] },
    };
    Ok(serde_json::to_string(&frame)?)
}

/// Translate one server payload into zero or more inbound events.
pub fn parse_server_message(payload: &str) -> VoiceResult<Vec<LiveInbound>> {
    let message: ServerMessage = serde_json::from_str(payload)?;
    let mut events = Vec::new();
    if message.setup_complete.is_some() {
        events.push(LiveInbound::Open);
    }
    if let Some(content) = message.server_content {
        if let Some(transcription) = content.input_transcription {
            if !transcription.text.is_empty() {
                events.push(LiveInbound::Transcript {
                    role: Role::User,
                    text: transcription.text,
                });
            }
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    events.push(LiveInbound::Audio(inline.data));
                }
            }
        }
        if let Some(transcription) = content.output_transcription {
            if !transcription.text.is_empty() {
                events.push(LiveInbound::Transcript {
                    role: Role::Model,
                    text: transcription.text,
                });
            }
        }
        if content.turn_complete {
            events.push(LiveInbound::TurnComplete);
        }
    }
    Ok(events)
}

/// Live transport over the Gemini BidiGenerateContent WebSocket.
#[derive(Debug, Clone)]
pub struct GeminiLiveTransport {
    ws_url: String,
}

impl GeminiLiveTransport {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self { ws_url: ws_url.into() }
    }

    fn endpoint(&self, api_key: &str) -> String {
        format!("{}{}?key={}", self.ws_url.trim_end_matches('/'), BIDI_PATH, api_key)
    }
}

#[async_trait]
impl LiveTransport for GeminiLiveTransport {
    async fn connect(&self, setup: LiveSetup) -> VoiceResult<LiveConnection> {
        if setup.api_key.trim().is_empty() {
            return Err(VoiceError::Configuration("Live API key is empty".to_string()));
        }
        info!("🌐 Connecting Live session ({})", setup.model);
        let (ws_stream, _) = connect_async(self.endpoint(&setup.api_key)).await?;
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(setup_frame(&setup)?)).await?;

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<LiveOutbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LiveInbound>();

        // Writer: drains outbound chunks until Close or the sender is dropped.
        tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                match outbound {
                    LiveOutbound::Media(chunk) => {
                        let text = match media_frame(&chunk) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Live: dropping unserializable chunk: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(text)).await {
                            debug!("Live: send failed, writer exiting: {}", e);
                            break;
                        }
                    }
                    LiveOutbound::Close => break,
                }
            }
            let _ = write.send(Message::Close(None)).await;
            debug!("Live: writer finished");
        });

        // Reader: maps frames to inbound events; always ends with Closed or Error.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let payload = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("Live: non-UTF-8 binary frame skipped");
                            continue;
                        }
                    },
                    Ok(Message::Close(close)) => {
                        let reason = close.map(|c| c.reason.to_string()).filter(|r| !r.is_empty());
                        let _ = in_tx.send(LiveInbound::Closed(reason));
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(LiveInbound::Error(e.into()));
                        return;
                    }
                };
                match parse_server_message(&payload) {
                    Ok(events) => {
                        for event in events {
                            if in_tx.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(e) => warn!("Live: unparseable server message skipped: {}", e),
                }
            }
            let _ = in_tx.send(LiveInbound::Closed(None));
        });

        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
