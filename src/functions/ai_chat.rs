use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::LocalFunction;
use crate::error::{Error, Result};
use crate::llm::openai::{GatewayClient, GatewayConfig};
use crate::llm::{ChatKind, ChatTurn};
use crate::platform::{ByteStream, Platform, Session};

#[derive(Debug, Deserialize)]
pub struct AiChatRequest {
    pub messages: Vec<ChatTurn>,
    #[serde(rename = "type", default)]
    pub kind: ChatKind,
}

/// Proxies a chat to the completion gateway and hands back its event stream.
pub struct AiChatProxy {
    gateway: GatewayClient,
}

impl AiChatProxy {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            gateway: GatewayClient::new(config),
        }
    }
}

#[async_trait]
impl LocalFunction for AiChatProxy {
    async fn call(
        &self,
        _platform: &dyn Platform,
        _caller: Option<Session>,
        body: Value,
    ) -> Result<ByteStream> {
        let request: AiChatRequest = serde_json::from_value(body).map_err(|e| Error::Function {
            status: 500,
            message: e.to_string(),
        })?;
        self.gateway.chat_stream(request.kind, &request.messages).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;
    use serde_json::json;

    #[test]
    fn test_request_defaults_to_chat() {
        let request: AiChatRequest =
            serde_json::from_value(json!({"messages": [{"role": "user", "content": "hi"}]}))
                .unwrap();
        assert_eq!(request.kind, ChatKind::Chat);
        assert_eq!(request.messages[0].role, Role::User);
    }

    #[test]
    fn test_request_reads_type() {
        let request: AiChatRequest =
            serde_json::from_value(json!({"messages": [], "type": "prioritize"})).unwrap();
        assert_eq!(request.kind, ChatKind::Prioritize);
    }
}
