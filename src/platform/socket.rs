//! Realtime change feeds over the platform's Phoenix-channel websocket.
//!
//! One socket per channel: join with a `postgres_changes` config, heartbeat
//! on an interval, leave on release. Reconnection is left to the caller.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};
use url::Url;

use super::{ChangeEvent, ChangeFeed, ChangeKind, ChannelSpec};
use crate::error::{Error, Result};

const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_REF: &str = "1";

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub url: Url,
    pub access_token: String,
    pub heartbeat: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref")]
    pub reference: Option<String>,
}

pub fn websocket_url(base: &Url, anon_key: &str) -> Result<Url> {
    let mut url = base.join("/realtime/v1/websocket")?;
    let scheme = if base.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|_| Error::Realtime(format!("cannot derive websocket url from {}", base)))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", "1.0.0");
    Ok(url)
}

pub fn channel_topic(spec: &ChannelSpec) -> String {
    format!("realtime:{}", spec.topic)
}

pub fn join_frame(spec: &ChannelSpec, access_token: &str) -> Frame {
    let mut change = json!({
        "event": spec.event_name(),
        "schema": "public",
        "table": spec.table,
    });
    if let Some(filter) = spec.filter_expr() {
        change["filter"] = Value::String(filter);
    }
    Frame {
        topic: channel_topic(spec),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [change],
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
    }
}

pub fn heartbeat_frame(reference: u64) -> Frame {
    Frame {
        topic: "phoenix".to_string(),
        event: "heartbeat".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

pub fn leave_frame(topic: &str, reference: u64) -> Frame {
    Frame {
        topic: topic.to_string(),
        event: "phx_leave".to_string(),
        payload: json!({}),
        reference: Some(reference.to_string()),
    }
}

/// Decodes a `postgres_changes` frame; any other frame yields `None`.
pub fn decode_change(frame: &Frame) -> Option<ChangeEvent> {
    if frame.event != "postgres_changes" {
        return None;
    }
    let data = frame.payload.get("data")?;
    let kind = match data.get("type")?.as_str()? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let table = data.get("table")?.as_str()?.to_string();
    let row = |key: &str| {
        data.get(key)
            .filter(|v| v.as_object().is_some_and(|map| !map.is_empty()))
            .cloned()
    };
    Some(ChangeEvent {
        table,
        kind,
        new: row("record"),
        old: row("old_record"),
    })
}

/// Join status carried by a `phx_reply` to our join, if this is one.
fn join_status(frame: &Frame) -> Option<std::result::Result<(), String>> {
    if frame.event != "phx_reply" || frame.reference.as_deref() != Some(JOIN_REF) {
        return None;
    }
    match frame.payload.get("status").and_then(Value::as_str) {
        Some("ok") => Some(Ok(())),
        _ => Some(Err(frame
            .payload
            .get("response")
            .map(Value::to_string)
            .unwrap_or_else(|| "join rejected".to_string()))),
    }
}

fn encode(frame: &Frame) -> Result<WsMessage> {
    Ok(WsMessage::Text(serde_json::to_string(frame)?))
}

pub async fn open_channel(config: SocketConfig, spec: ChannelSpec) -> Result<ChangeFeed> {
    let (ws, _) = connect_async(config.url.as_str()).await?;
    let (mut write, mut read) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let topic = channel_topic(&spec);

    write.send(encode(&join_frame(&spec, &config.access_token))?).await?;

    let joined = tokio::time::timeout(JOIN_TIMEOUT, async {
        while let Some(msg) = read.next().await {
            let WsMessage::Text(text) = msg? else {
                continue;
            };
            let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                continue;
            };
            if let Some(status) = join_status(&frame) {
                return status.map_err(Error::Realtime);
            }
            if let Some(event) = decode_change(&frame) {
                let _ = tx.send(event);
            }
        }
        Err(Error::Realtime("socket closed before join".to_string()))
    })
    .await
    .map_err(|_| Error::Realtime("join timed out".to_string()))?;
    if let Err(err) = joined {
        warn!(topic = %topic, error = %err, "realtime join failed");
        return Err(err);
    }
    info!(topic = %topic, "realtime channel joined");

    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let task_topic = topic.clone();
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(config.heartbeat);
        heartbeat.tick().await;
        let mut reference: u64 = 1;
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    reference += 1;
                    if let Ok(frame) = encode(&leave_frame(&task_topic, reference)) {
                        let _ = write.send(frame).await;
                    }
                    let _ = write.close().await;
                    break;
                }
                _ = heartbeat.tick() => {
                    reference += 1;
                    let sent = match encode(&heartbeat_frame(reference)) {
                        Ok(frame) => write.send(frame).await.map_err(Error::from),
                        Err(err) => Err(err),
                    };
                    if let Err(err) = sent {
                        warn!(topic = %task_topic, error = %err, "realtime heartbeat failed");
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(frame) = serde_json::from_str::<Frame>(&text) else {
                            debug!(topic = %task_topic, "ignoring undecodable frame");
                            continue;
                        };
                        if let Some(event) = decode_change(&frame) {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(topic = %task_topic, error = %err, "realtime socket error");
                        break;
                    }
                },
            }
        }
        debug!(topic = %task_topic, "realtime socket closed");
    });

    Ok(ChangeFeed::new(topic, rx, move || {
        let _ = stop_tx.send(());
    }))
}
