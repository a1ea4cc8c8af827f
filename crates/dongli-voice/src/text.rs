//! Text-only exchange. Always available; the last step of the fallback chain.

use crate::error::{VoiceError, VoiceResult};
use crate::events::{DriverEvents, ReplyGenerator, Role, TranscriptEvent};
use std::sync::Arc;

pub struct TextDriver {
    events: Arc<dyn DriverEvents>,
    replies: Option<Arc<dyn ReplyGenerator>>,
}

impl TextDriver {
    pub fn new(events: Arc<dyn DriverEvents>, replies: Option<Arc<dyn ReplyGenerator>>) -> Self {
        Self { events, replies }
    }

    /// Emit the user's line and, when a reply generator is wired, the reply.
    pub async fn send(&self, text: &str) -> VoiceResult<Option<String>> {
        let text = text.trim();
        if text.is_empty() {
            return Err(VoiceError::Protocol("message text is empty".to_string()));
        }
        self.events.on_transcript(TranscriptEvent::new(Role::User, text, true));

        let Some(replies) = &self.replies else {
            return Ok(None);
        };
        let reply = replies.reply(text).await?;
        self.events
            .on_transcript(TranscriptEvent::new(Role::Model, reply.clone(), true));
        Ok(Some(reply))
    }
}
