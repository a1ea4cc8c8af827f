//! Voice chat demo: fallback chain end to end on this machine.
//!
//! Keys come from `.env` / the environment (see `config` module docs):
//! `DONGLI__LIVE__API_KEYS`, `SHENGSUANYUN_API_KEY`, `DONGLI__RELAY__BACKEND_URL`.
//!
//! - Enter on an empty line finishes a half-duplex turn and starts the next one.
//! - Any other line is sent as text.
//! - `q` quits.

use anyhow::Context;
use async_trait::async_trait;
use dongli_voice::{
    ChannelSink, ConversationMode, ReplyGenerator, VoiceConfig, VoiceEvent, VoiceOrchestrator, VoiceOutput,
    VoiceResult,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

struct EchoGuide;

#[async_trait]
impl ReplyGenerator for EchoGuide {
    async fn reply(&self, user_text: &str) -> VoiceResult<String> {
        Ok(format!("欢迎来到东里村！你刚才说：{}", user_text))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = VoiceConfig::load().context("loading voice config")?;
    let (sink, mut events) = ChannelSink::new();
    let mut orchestrator = VoiceOrchestrator::from_config(config, Arc::new(sink)).context("building orchestrator")?;
    let availability = orchestrator.check_availability().await;
    info!("Availability: {:?}", availability);

    // Without an output device the demo still prints transcripts.
    let mut output = VoiceOutput::new().ok();
    if let Err(e) = orchestrator.start_conversation().await {
        warn!("{}", e);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = events.recv() => match event {
                VoiceEvent::ModeChanged(mode) => info!("mode: {:?}", mode),
                VoiceEvent::Transcription(t) => info!("{:?}: {}", t.role, t.text),
                VoiceEvent::AudioData(buffer) => {
                    if let Some(output) = output.as_mut() {
                        output.play(&buffer);
                    }
                }
                VoiceEvent::Error { kind, message, retryable } => {
                    warn!("{} error (retryable: {}): {}", kind, retryable, message)
                }
                VoiceEvent::Status(message) => info!("{}", message),
            },
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match line.trim() {
                    "q" => break,
                    "" => match orchestrator.mode() {
                        ConversationMode::WhisperRecording | ConversationMode::QwenRecording => {
                            if orchestrator.finish_turn().await.is_ok() {
                                let _ = orchestrator.begin_turn().await;
                            }
                        }
                        ConversationMode::Idle if orchestrator.active_driver().is_some() => {
                            let _ = orchestrator.begin_turn().await;
                        }
                        other => info!("nothing to finish in {:?}", other),
                    },
                    text => {
                        if let Err(e) = orchestrator.send_text(text).await {
                            warn!("{}", e);
                        }
                    }
                }
            }
        }
    }

    orchestrator.stop_conversation().await;
    if let Some(output) = output.as_mut() {
        output.stop();
    }
    Ok(())
}
