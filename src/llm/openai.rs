use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::sse::StreamEvent;
use super::{ChatKind, ChatTurn};
use crate::error::{Error, Result};
use crate::platform::ByteStream;

pub const RATE_LIMIT_MESSAGE: &str = "Rate limit exceeded. Please try again in a moment.";
pub const QUOTA_MESSAGE: &str = "AI usage limit reached. Please contact support.";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub url: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatTurn>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

/// Prepends the system prompt for `kind`; `suggest` also forces the
/// `suggest_tasks` tool.
pub fn build_request(model: &str, kind: ChatKind, turns: &[ChatTurn]) -> CompletionRequest {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    messages.push(ChatTurn::system(kind.system_prompt()));
    messages.extend(turns.iter().cloned());

    let (tools, tool_choice) = match kind {
        ChatKind::Suggest => (
            Some(vec![suggest_tasks_tool()]),
            Some(json!({"type": "function", "function": {"name": "suggest_tasks"}})),
        ),
        _ => (None, None),
    };

    CompletionRequest {
        model: model.to_string(),
        messages,
        stream: true,
        tools,
        tool_choice,
    }
}

pub fn suggest_tasks_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "suggest_tasks",
            "description": "Return 3-5 actionable task suggestions based on the conversation.",
            "parameters": {
                "type": "object",
                "properties": {
                    "suggestions": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "title": { "type": "string", "description": "Clear, actionable task title (max 100 chars)" },
                                "description": { "type": "string", "description": "Brief description with context" },
                                "priority": { "type": "string", "enum": ["low", "medium", "high"] },
                                "category": { "type": "string", "description": "Category like Personal, Work, Shopping, Health" }
                            },
                            "required": ["title", "priority", "category"],
                            "additionalProperties": false
                        }
                    }
                },
                "required": ["suggestions"],
                "additionalProperties": false
            }
        }
    })
}

// ── Streamed deltas ──

#[derive(Debug, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallDelta>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    function: Option<FunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct FunctionDelta {
    arguments: Option<String>,
}

impl CompletionChunk {
    /// Only the first choice is read. Empty fragments are dropped.
    pub fn into_events(self) -> Vec<StreamEvent> {
        let Some(delta) = self.choices.into_iter().next().and_then(|c| c.delta) else {
            return vec![StreamEvent::Unrecognized];
        };
        let mut events = Vec::new();
        if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
            events.push(StreamEvent::Content(content));
        }
        let arguments = delta
            .tool_calls
            .into_iter()
            .next()
            .and_then(|call| call.function)
            .and_then(|function| function.arguments)
            .filter(|args| !args.is_empty());
        if let Some(arguments) = arguments {
            events.push(StreamEvent::ToolCall(arguments));
        }
        if events.is_empty() {
            events.push(StreamEvent::Unrecognized);
        }
        events
    }
}

/// Classifies one parsed `data:` payload. Payloads that are valid JSON but
/// not shaped like a completion chunk are unrecognized.
pub fn classify(payload: Value) -> Vec<StreamEvent> {
    match serde_json::from_value::<CompletionChunk>(payload) {
        Ok(chunk) => chunk.into_events(),
        Err(_) => vec![StreamEvent::Unrecognized],
    }
}

// ── Gateway ──

/// OpenAI-compatible completion gateway behind the `ai-chat` function.
pub struct GatewayClient {
    client: Client,
    config: GatewayConfig,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    pub async fn chat_stream(&self, kind: ChatKind, turns: &[ChatTurn]) -> Result<ByteStream> {
        if self.config.api_key.is_empty() {
            return Err(Error::Function {
                status: 500,
                message: "AI gateway key is not configured".to_string(),
            });
        }
        let body = build_request(&self.config.model, kind, turns);
        debug!(model = %self.config.model, turns = turns.len(), "requesting completion stream");

        let resp = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(Error::RateLimited(RATE_LIMIT_MESSAGE.to_string()))
            }
            StatusCode::PAYMENT_REQUIRED => {
                return Err(Error::QuotaExceeded(QUOTA_MESSAGE.to_string()))
            }
            status if !status.is_success() => {
                let text = resp.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), body = %text, "AI gateway error");
                return Err(Error::Function {
                    status: 500,
                    message: format!("AI gateway error: {}", status.as_u16()),
                });
            }
            _ => {}
        }

        Ok(resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use crate::platform::testing::serve_status;

    async fn gateway_error(status: u16) -> Error {
        let url = serve_status(status, json!({"error": {"message": "upstream"}})).await;
        let gateway = GatewayClient::new(GatewayConfig {
            api_key: "key".into(),
            url,
            model: "m".into(),
        });
        match gateway.chat_stream(ChatKind::Chat, &[ChatTurn::user("hi")]).await {
            Err(err) => err,
            Ok(_) => panic!("expected {} to fail", status),
        }
    }

    #[tokio::test]
    async fn test_gateway_status_mapping() {
        let err = gateway_error(429).await;
        assert!(matches!(&err, Error::RateLimited(m) if m == RATE_LIMIT_MESSAGE));

        let err = gateway_error(402).await;
        assert!(matches!(&err, Error::QuotaExceeded(m) if m == QUOTA_MESSAGE));

        let err = gateway_error(503).await;
        assert!(matches!(
            &err,
            Error::Function { status: 500, message } if message == "AI gateway error: 503"
        ));
    }

    #[test]
    fn test_chat_request_has_system_prompt_and_no_tools() {
        let request = build_request("m", ChatKind::Chat, &[ChatTurn::user("hi")]);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert!(request.stream);
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("tools").is_none());
        assert!(body.get("tool_choice").is_none());
    }

    #[test]
    fn test_suggest_request_forces_tool() {
        let request = build_request("m", ChatKind::Suggest, &[ChatTurn::user("plan my week")]);
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["tools"][0]["function"]["name"], "suggest_tasks");
        assert_eq!(body["tool_choice"]["function"]["name"], "suggest_tasks");
        assert_eq!(body["messages"][1]["content"], "plan my week");
    }

    #[test]
    fn test_classify_content_and_tool_call() {
        let events = classify(json!({
            "choices": [{"delta": {
                "content": "Hi",
                "tool_calls": [{"function": {"arguments": "{\"sug"}}]
            }}]
        }));
        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hi".into()),
                StreamEvent::ToolCall("{\"sug".into())
            ]
        );
    }

    #[test]
    fn test_classify_unrecognized_shapes() {
        assert_eq!(classify(json!({"choices": []})), vec![StreamEvent::Unrecognized]);
        assert_eq!(classify(json!({"choices": "nope"})), vec![StreamEvent::Unrecognized]);
        assert_eq!(
            classify(json!({"choices": [{"delta": {"content": ""}}]})),
            vec![StreamEvent::Unrecognized]
        );
    }

    #[tokio::test]
    async fn test_missing_key_fails_before_request() {
        let gateway = GatewayClient::new(GatewayConfig {
            api_key: String::new(),
            url: "http://127.0.0.1:9/v1/chat/completions".into(),
            model: "m".into(),
        });
        let err = gateway
            .chat_stream(ChatKind::Chat, &[ChatTurn::user("hi")])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Function { status: 500, .. }));
    }
}
