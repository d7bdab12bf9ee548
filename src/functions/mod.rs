//! Serverless functions, written against [`Platform`] so the local backend
//! can mount them.

pub mod ai_chat;
pub mod auto_reply;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::Value;

use crate::error::Result;
use crate::platform::{ByteStream, Platform, Session};

pub const AI_CHAT: &str = "ai-chat";
pub const SEND_AUTO_REPLY: &str = "send-auto-reply";

#[async_trait]
pub trait LocalFunction: Send + Sync {
    async fn call(
        &self,
        platform: &dyn Platform,
        caller: Option<Session>,
        body: Value,
    ) -> Result<ByteStream>;
}

pub fn json_body(value: &Value) -> ByteStream {
    let bytes = value.to_string().into_bytes();
    stream::once(async move { Ok(bytes) }).boxed()
}

/// Drains a function response into one JSON value.
pub async fn read_json(body: ByteStream) -> Result<Value> {
    let bytes: Vec<u8> = body
        .try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await?;
    Ok(serde_json::from_slice(&bytes)?)
}
