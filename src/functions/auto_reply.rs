use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::{json_body, LocalFunction};
use crate::db::models::{now, Message, UserConversation, CONVERSATIONS, MESSAGES, USER_CONVERSATIONS};
use crate::error::{Error, Result};
use crate::platform::{decode_rows, decode_single, ByteStream, Platform, Query, Session};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoReplyRequest {
    pub conversation_id: String,
    pub message: String,
}

/// Replies into a two-party conversation as the caller's counterpart.
pub struct AutoReply;

impl AutoReply {
    pub async fn run(
        platform: &dyn Platform,
        caller: Option<&Session>,
        request: &AutoReplyRequest,
    ) -> Result<Message> {
        let caller = caller.ok_or_else(|| failure("Unauthorized"))?;

        let members: Vec<UserConversation> = decode_rows(
            platform
                .select(&Query::table(USER_CONVERSATIONS).eq("conversation_id", request.conversation_id.as_str()))
                .await?,
        )?;
        if members.is_empty() {
            return Err(failure("No participants found"));
        }
        let other = members
            .iter()
            .find(|member| member.user_id != caller.user_id)
            .ok_or_else(|| failure("No other user found in conversation"))?;

        debug!(conversation_id = %request.conversation_id, sender = %other.user_id, "sending auto reply");
        let rows = platform
            .insert(
                MESSAGES,
                vec![json!({
                    "conversation_id": request.conversation_id,
                    "sender_id": other.user_id,
                    "content": request.message,
                    "message_type": "text",
                })],
            )
            .await?;
        let message: Message = decode_single(rows, "inserted message")?;

        platform
            .update(
                &Query::table(CONVERSATIONS).eq("id", request.conversation_id.as_str()),
                json!({ "updated_at": now() }),
            )
            .await?;

        Ok(message)
    }
}

#[async_trait]
impl LocalFunction for AutoReply {
    async fn call(
        &self,
        platform: &dyn Platform,
        caller: Option<Session>,
        body: Value,
    ) -> Result<ByteStream> {
        let request: AutoReplyRequest =
            serde_json::from_value(body).map_err(|e| failure(&e.to_string()))?;
        match Self::run(platform, caller.as_ref(), &request).await {
            Ok(message) => Ok(json_body(&json!({ "success": true, "message": message }))),
            Err(err @ Error::Function { .. }) => Err(err),
            Err(err) => Err(failure(&err.to_string())),
        }
    }
}

fn failure(message: &str) -> Error {
    Error::Function {
        status: 400,
        message: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::functions::{read_json, SEND_AUTO_REPLY};

    async fn conversation_with(db: &Database, members: &[&str]) -> String {
        let conv = db
            .insert(CONVERSATIONS, vec![json!({"name": "Sam"})])
            .await
            .unwrap()
            .remove(0);
        let id = conv["id"].as_str().unwrap().to_string();
        let rows = members
            .iter()
            .map(|user| json!({"user_id": user, "conversation_id": id}))
            .collect();
        db.insert(USER_CONVERSATIONS, rows).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_replies_as_other_participant() {
        let db = Database::open_in_memory().unwrap();
        db.sign_in_as("me").unwrap();
        let id = conversation_with(&db, &["me", "sam"]).await;

        let body = db
            .invoke(SEND_AUTO_REPLY, json!({"conversationId": id, "message": "on my way"}))
            .await
            .unwrap();
        let response = read_json(body).await.unwrap();
        assert_eq!(response["success"], true);
        assert_eq!(response["message"]["sender_id"], "sam");
        assert_eq!(response["message"]["content"], "on my way");
    }

    #[tokio::test]
    async fn test_fails_without_other_participant() {
        let db = Database::open_in_memory().unwrap();
        db.sign_in_as("me").unwrap();
        let id = conversation_with(&db, &["me"]).await;

        let err = db
            .invoke(SEND_AUTO_REPLY, json!({"conversationId": id, "message": "hi"}))
            .await
            .err()
            .unwrap();
        match err {
            Error::Function { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "No other user found in conversation");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_requires_caller() {
        let db = Database::open_in_memory().unwrap();
        let id = conversation_with(&db, &["me", "sam"]).await;
        let err = db
            .invoke(SEND_AUTO_REPLY, json!({"conversationId": id, "message": "hi"}))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Function { status: 400, .. }));
    }
}
