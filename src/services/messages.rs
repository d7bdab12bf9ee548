use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::db::models::*;
use crate::error::{Error, Result};
use crate::functions::{read_json, SEND_AUTO_REPLY};
use crate::platform::{
    decode_rows, decode_single, require_session, to_row, ChangeKind, ChannelSpec, Platform, Query,
    Session,
};
use crate::realtime::{self, Subscription};

pub const PAGE_SIZE: usize = 50;
const TITLE_CHARS: usize = 100;
const FALLBACK_TITLE: &str = "New task from message";

pub struct MessageService {
    platform: Arc<dyn Platform>,
}

impl MessageService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    fn session(&self) -> Result<Session> {
        require_session(&*self.platform)
    }

    /// One page counted back from the newest message, returned oldest first.
    pub async fn list(&self, conversation_id: &str, limit: usize, offset: usize) -> Result<Vec<Message>> {
        self.session()?;
        if limit == 0 {
            return Ok(Vec::new());
        }
        let query = Query::table(MESSAGES)
            .eq("conversation_id", conversation_id)
            .order("created_at", false)
            .range(offset, offset.saturating_add(limit - 1));
        let mut messages: Vec<Message> = decode_rows(self.platform.select(&query).await?)?;
        messages.reverse();
        Ok(messages)
    }

    pub async fn send(&self, conversation_id: &str, message: &NewMessage) -> Result<Message> {
        let session = self.session()?;
        let row = to_row(
            message,
            &[
                ("conversation_id", json!(conversation_id)),
                ("sender_id", json!(session.user_id)),
            ],
        )?;
        let rows = self.platform.insert(MESSAGES, vec![row]).await?;
        decode_single(rows, "inserted message")
    }

    pub async fn update(&self, message_id: &str, content: &str) -> Result<Message> {
        self.session()?;
        let rows = self
            .platform
            .update(
                &Query::table(MESSAGES).eq("id", message_id),
                json!({ "content": content }),
            )
            .await?;
        decode_single(rows, "message")
    }

    pub async fn delete(&self, message_id: &str) -> Result<()> {
        self.session()?;
        self.platform
            .delete(&Query::table(MESSAGES).eq("id", message_id))
            .await?;
        Ok(())
    }

    /// Text messages in the caller's conversations containing `text`,
    /// case-insensitively, newest first.
    pub async fn search(&self, text: &str) -> Result<Vec<Message>> {
        let session = self.session()?;
        let memberships: Vec<UserConversation> = decode_rows(
            self.platform
                .select(&Query::table(USER_CONVERSATIONS).eq("user_id", session.user_id.as_str()))
                .await?,
        )?;
        if memberships.is_empty() || text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<&str> = memberships.iter().map(|m| m.conversation_id.as_str()).collect();
        let query = Query::table(MESSAGES)
            .is_in("conversation_id", ids)
            .eq("message_type", "text")
            .contains("content", text.trim())
            .order("created_at", false)
            .limit(PAGE_SIZE);
        decode_rows(self.platform.select(&query).await?)
    }

    pub async fn convert_to_task(&self, message_id: &str) -> Result<Task> {
        let session = self.session()?;
        let rows = self
            .platform
            .select(&Query::table(MESSAGES).eq("id", message_id))
            .await?;
        let message: Message = decode_single(rows, "message")?;

        let title = message
            .content
            .as_deref()
            .filter(|content| !content.is_empty())
            .map(|content| content.chars().take(TITLE_CHARS).collect::<String>())
            .unwrap_or_else(|| FALLBACK_TITLE.to_string());
        let task = NewTask {
            title,
            description: message.content.clone(),
            priority: Priority::Medium,
            created_from_message_id: Some(message.id.clone()),
            ..NewTask::default()
        };
        let rows = self
            .platform
            .insert(TASKS, vec![to_row(&task, &[("user_id", json!(session.user_id))])?])
            .await?;
        debug!(message_id, "converted message to task");
        decode_single(rows, "inserted task")
    }

    /// Asks the backend to answer as the other participant.
    pub async fn request_auto_reply(&self, conversation_id: &str, text: &str) -> Result<Message> {
        self.session()?;
        let body = self
            .platform
            .invoke(
                SEND_AUTO_REPLY,
                json!({ "conversationId": conversation_id, "message": text }),
            )
            .await?;
        let mut response = read_json(body).await?;
        let message = response
            .get_mut("message")
            .map(serde_json::Value::take)
            .ok_or_else(|| Error::Function {
                status: 500,
                message: "auto reply returned no message".to_string(),
            })?;
        Ok(serde_json::from_value(message)?)
    }

    /// Delivers each message inserted into the conversation.
    pub async fn subscribe<F>(&self, conversation_id: &str, on_insert: F) -> Result<Subscription>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let spec = ChannelSpec::new(format!("messages:{}", conversation_id), MESSAGES)
            .on(ChangeKind::Insert)
            .filter_eq("conversation_id", conversation_id);
        realtime::subscribe(&*self.platform, spec, realtime::rows(on_insert)).await
    }
}

/// Messages on screen, ordered by creation time. Local sends and realtime
/// echoes both go through [`MessageTimeline::upsert`], which keys on id, so
/// a sender never sees their own message twice.
#[derive(Debug, Clone, Default)]
pub struct MessageTimeline {
    messages: Vec<Message>,
}

impl MessageTimeline {
    pub fn new(mut messages: Vec<Message>) -> Self {
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns false when the message was already present and got replaced.
    pub fn upsert(&mut self, message: Message) -> bool {
        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == message.id) {
            *existing = message;
            return false;
        }
        let at = self
            .messages
            .partition_point(|m| m.created_at <= message.created_at);
        self.messages.insert(at, message);
        true
    }

    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        let at = self.messages.iter().position(|m| m.id == message_id)?;
        Some(self.messages.remove(at))
    }
}
