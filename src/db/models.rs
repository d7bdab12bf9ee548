use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CONVERSATIONS: &str = "conversations";
pub const USER_CONVERSATIONS: &str = "user_conversations";
pub const MESSAGES: &str = "messages";
pub const TASKS: &str = "tasks";
pub const CATEGORIES: &str = "categories";
pub const PROFILES: &str = "profiles";
pub const FOCUS_SESSIONS: &str = "focus_sessions";
pub const NOTIFICATIONS: &str = "notifications";

/// Fixed-width UTC timestamp, so stored values order lexicographically.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

pub fn now() -> String {
    timestamp(Utc::now())
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|at| at.with_timezone(&Utc))
}

// ── Conversations ──

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Conversation {
    pub id: String,
    pub name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    pub avatar_url: Option<String>,
    #[serde(default = "default_category")]
    pub category: String,
    pub created_by: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn default_category() -> String {
    "other".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserConversation {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub is_pinned: bool,
    pub last_read_at: Option<String>,
    pub joined_at: String,
}

/// A membership row paired with the conversation it points at.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct ConversationEntry {
    pub membership: UserConversation,
    pub conversation: Conversation,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct ConversationUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

// ── Messages ──

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Voice,
    File,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: Option<String>,
    #[serde(default)]
    pub message_type: MessageType,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub voice_duration: Option<i64>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct NewMessage {
    pub content: Option<String>,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_duration: Option<i64>,
}

impl NewMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            ..Self::default()
        }
    }

    pub fn voice(file_url: impl Into<String>, duration_secs: i64) -> Self {
        Self {
            message_type: MessageType::Voice,
            file_url: Some(file_url.into()),
            voice_duration: Some(duration_secs),
            ..Self::default()
        }
    }

    pub fn file(file_url: impl Into<String>, file_name: impl Into<String>) -> Self {
        Self {
            message_type: MessageType::File,
            file_url: Some(file_url.into()),
            file_name: Some(file_name.into()),
            ..Self::default()
        }
    }
}

// ── Tasks ──

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Task {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    pub category_id: Option<String>,
    pub due_date: Option<String>,
    #[serde(default)]
    pub is_completed: bool,
    pub completed_at: Option<String>,
    pub created_from_message_id: Option<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct NewTask {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub priority: Priority,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_from_message_id: Option<String>,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Category {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub color: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct CategoryUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

// ── Profiles ──

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Profile {
    pub id: String,
    pub user_id: String,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub avatar_url: Option<String>,
    pub bio: Option<String>,
    pub phone_number: Option<String>,
    #[serde(default)]
    pub notification_preferences: Value,
    #[serde(default)]
    pub app_preferences: Value,
    pub created_at: String,
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize, Default, Clone)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_preferences: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_preferences: Option<Value>,
}

// ── Focus ──

/// Append-only log entry; `duration` is in minutes.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FocusSession {
    pub id: String,
    pub user_id: String,
    pub duration: i64,
    pub task_id: Option<String>,
    pub completed_at: String,
    pub created_at: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct DailyFocus {
    pub date: String,
    pub minutes: i64,
}

// ── Notifications ──

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Message,
    Task,
    Focus,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    pub created_at: String,
}
