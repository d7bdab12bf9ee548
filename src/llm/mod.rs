pub mod openai;
pub mod sse;

use serde::{Deserialize, Serialize};

use crate::db::models::{NewTask, Priority};
use crate::error::Result;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Selects the assistant's system prompt. Unknown kinds fall back to chat.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Suggest,
    Prioritize,
    #[default]
    #[serde(other)]
    Chat,
}

impl ChatKind {
    pub fn system_prompt(self) -> &'static str {
        match self {
            ChatKind::Chat => CHAT_PROMPT,
            ChatKind::Suggest => SUGGEST_PROMPT,
            ChatKind::Prioritize => PRIORITIZE_PROMPT,
        }
    }
}

const CHAT_PROMPT: &str = "You are an ADHD-friendly AI assistant for WhatsMind. Your responses should be:
- Clear and concise (avoid long paragraphs)
- Structured with bullet points when appropriate
- Encouraging and supportive
- Focused on actionable advice
- Understanding of executive dysfunction and time blindness
Help users with productivity, task management, and staying focused.";

const SUGGEST_PROMPT: &str = "You are a task suggestion assistant for ADHD users. Analyze the conversation and:
- Break down complex tasks into smaller, manageable steps
- Suggest realistic priorities based on urgency and importance
- Recommend appropriate categories (Personal, Work, Shopping, Health, etc.)
- Consider executive dysfunction when estimating task difficulty
Respond ONLY with task suggestions using the provided tool.";

const PRIORITIZE_PROMPT: &str = "You are a task prioritization expert for ADHD users. Help them:
- Identify which tasks truly matter today
- Recognize which tasks can wait
- Avoid overwhelming to-do lists
- Focus on 3-5 key tasks maximum per day
Be compassionate about task paralysis and decision fatigue.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TaskSuggestion {
    pub title: String,
    pub description: Option<String>,
    pub priority: Priority,
    pub category: String,
}

#[derive(Debug, Deserialize)]
struct SuggestionList {
    suggestions: Vec<TaskSuggestion>,
}

/// Decodes the `suggest_tasks` tool arguments accumulated from a stream.
pub fn parse_suggestions(arguments: &str) -> Result<Vec<TaskSuggestion>> {
    let list: SuggestionList = serde_json::from_str(arguments)?;
    Ok(list.suggestions)
}

impl From<TaskSuggestion> for NewTask {
    fn from(suggestion: TaskSuggestion) -> Self {
        NewTask {
            title: suggestion.title,
            description: suggestion.description,
            priority: suggestion.priority,
            ..NewTask::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_falls_back_to_chat() {
        let kind: ChatKind = serde_json::from_str("\"brainstorm\"").unwrap();
        assert_eq!(kind, ChatKind::Chat);
        let kind: ChatKind = serde_json::from_str("\"suggest\"").unwrap();
        assert_eq!(kind, ChatKind::Suggest);
    }

    #[test]
    fn test_parse_suggestions() {
        let args = r#"{"suggestions":[{"title":"Pack gym bag","priority":"high","category":"Health"}]}"#;
        let suggestions = parse_suggestions(args).unwrap();
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].priority, Priority::High);
        let task: NewTask = suggestions[0].clone().into();
        assert_eq!(task.title, "Pack gym bag");
    }
}
