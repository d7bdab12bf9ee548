use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::Result;
use crate::functions::AI_CHAT;
use crate::llm::sse::fragments;
use crate::llm::{parse_suggestions, ChatKind, ChatTurn, Role, TaskSuggestion};
use crate::platform::{require_session, Platform};

#[derive(Serialize)]
struct ChatRequest<'a> {
    messages: &'a [ChatTurn],
    #[serde(rename = "type")]
    kind: ChatKind,
}

/// One assistant conversation. Turns only ever reflect confirmed exchanges
/// plus the reply currently streaming in; a failed send leaves them as they
/// were before it.
///
/// `send` takes `&mut self` for the whole stream, so a second send on the
/// same chat cannot start until the first has finished.
pub struct AiChat {
    platform: Arc<dyn Platform>,
    kind: ChatKind,
    turns: Vec<ChatTurn>,
}

impl AiChat {
    pub fn new(platform: Arc<dyn Platform>, kind: ChatKind) -> Self {
        Self {
            platform,
            kind,
            turns: Vec::new(),
        }
    }

    pub fn with_turns(mut self, turns: Vec<ChatTurn>) -> Self {
        self.turns = turns;
        self
    }

    pub fn kind(&self) -> ChatKind {
        self.kind
    }

    pub fn turns(&self) -> &[ChatTurn] {
        &self.turns
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Sends `text` and streams the reply into the trailing assistant turn,
    /// calling `on_update` after every change to the turns. Returns the full
    /// reply text.
    pub async fn send<F>(&mut self, text: &str, mut on_update: F) -> Result<String>
    where
        F: FnMut(&[ChatTurn]),
    {
        require_session(&*self.platform)?;

        let before = self.turns.len();
        self.turns.push(ChatTurn::user(text));
        on_update(&self.turns);

        match self.stream_reply(&mut on_update).await {
            Ok(reply) => {
                debug!(kind = ?self.kind, chars = reply.len(), "assistant reply complete");
                Ok(reply)
            }
            Err(error) => {
                warn!(error = %error, "assistant reply failed, rolling back");
                self.turns.truncate(before);
                on_update(&self.turns);
                Err(error)
            }
        }
    }

    async fn stream_reply<F>(&mut self, on_update: &mut F) -> Result<String>
    where
        F: FnMut(&[ChatTurn]),
    {
        let body = serde_json::to_value(ChatRequest {
            messages: &self.turns,
            kind: self.kind,
        })?;
        let response = self.platform.invoke(AI_CHAT, body).await?;

        let mut events = fragments(response);
        let mut reply = String::new();
        while let Some(event) = events.next().await {
            let event = event?;
            let Some(text) = event.text() else {
                continue;
            };
            reply.push_str(text);
            match self.turns.last_mut() {
                Some(turn) if turn.role == Role::Assistant => turn.content.clone_from(&reply),
                _ => self.turns.push(ChatTurn::assistant(reply.clone())),
            }
            on_update(&self.turns);
        }
        Ok(reply)
    }

    /// Task suggestions carried by the latest assistant turn of a `suggest`
    /// chat; empty before any reply.
    pub fn suggestions(&self) -> Result<Vec<TaskSuggestion>> {
        match self.turns.iter().rev().find(|turn| turn.role == Role::Assistant) {
            Some(turn) => parse_suggestions(&turn.content),
            None => Ok(Vec::new()),
        }
    }
}
