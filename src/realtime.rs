//! Bridges change-feed events into caller callbacks.
//!
//! A [`Subscription`] owns its channel: dropping it, or calling
//! [`Subscription::unsubscribe`], releases the channel on the backend and
//! guarantees the callback is not invoked again, even for events that were
//! already queued.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::Result;
use crate::platform::{ChangeEvent, ChangeFeed, ChannelSpec, Platform};

pub struct Subscription {
    topic: String,
    active: Arc<AtomicBool>,
    feed: ChangeFeed,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn unsubscribe(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.feed.release();
        info!(topic = %self.topic, "unsubscribed");
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens a channel and invokes `callback` for each event, in the order the
/// backend emits them. No deduplication, no reconnection.
pub async fn subscribe<F>(
    platform: &dyn Platform,
    spec: ChannelSpec,
    mut callback: F,
) -> Result<Subscription>
where
    F: FnMut(ChangeEvent) + Send + 'static,
{
    let mut feed = platform.subscribe(spec).await?;
    let topic = feed.topic.clone();
    let mut events = feed.take_events();
    let active = Arc::new(AtomicBool::new(true));

    let flag = active.clone();
    let task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if !flag.load(Ordering::Acquire) {
                break;
            }
            callback(event);
        }
    });
    info!(topic = %topic, "subscribed");

    Ok(Subscription {
        topic,
        active,
        feed,
        task: Some(task),
    })
}

/// Runs `body` with a live subscription and releases it on every exit path.
pub async fn with_subscription<F, Fut, T>(
    platform: &dyn Platform,
    spec: ChannelSpec,
    callback: F,
    body: Fut,
) -> Result<T>
where
    F: FnMut(ChangeEvent) + Send + 'static,
    Fut: Future<Output = Result<T>>,
{
    let subscription = subscribe(platform, spec, callback).await?;
    let result = body.await;
    subscription.unsubscribe();
    result
}

/// Adapts a typed row callback: decodes the event's new row, dropping rows
/// that do not decode.
pub fn rows<T, F>(mut callback: F) -> impl FnMut(ChangeEvent) + Send + 'static
where
    T: DeserializeOwned + 'static,
    F: FnMut(T) + Send + 'static,
{
    move |event: ChangeEvent| {
        let Some(row) = event.new else {
            return;
        };
        match serde_json::from_value::<T>(row) {
            Ok(record) => callback(record),
            Err(error) => warn!(table = %event.table, error = %error, "dropping undecodable row"),
        }
    }
}

/// Adapts a payload-less "something changed, reload" callback.
pub fn reload<F>(mut callback: F) -> impl FnMut(ChangeEvent) + Send + 'static
where
    F: FnMut() + Send + 'static,
{
    move |_event: ChangeEvent| callback()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::TASKS;
    use crate::db::Database;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn insert_task(db: &Database, user: &str) {
        db.insert(TASKS, vec![json!({"user_id": user, "title": "t"})])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_callback_receives_matching_events() {
        let db = Database::open_in_memory().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = ChannelSpec::new("tasks:u1", TASKS).filter_eq("user_id", "u1");
        let _subscription = subscribe(&db, spec, move |event| {
            let _ = tx.send(event);
        })
        .await
        .unwrap();

        insert_task(&db, "u2").await;
        insert_task(&db, "u1").await;
        let event = rx.recv().await.unwrap();
        assert_eq!(event.new.unwrap()["user_id"], "u1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_in_flight_events() {
        let db = Database::open_in_memory().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let subscription = subscribe(&db, ChannelSpec::new("tasks", TASKS), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        // Queued but not yet delivered: the test runtime has not yielded.
        insert_task(&db, "u1").await;
        subscription.unsubscribe();
        assert_eq!(db.live_channels(), 0);

        insert_task(&db, "u1").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_drop_releases_channel() {
        let db = Database::open_in_memory().unwrap();
        {
            let subscription = subscribe(&db, ChannelSpec::new("tasks", TASKS), |_| {})
                .await
                .unwrap();
            assert!(subscription.is_active());
            assert_eq!(db.live_channels(), 1);
        }
        assert_eq!(db.live_channels(), 0);
    }

    #[tokio::test]
    async fn test_with_subscription_releases_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = with_subscription(
            &db,
            ChannelSpec::new("tasks", TASKS),
            |_| {},
            async { Err(crate::error::Error::NotFound("x".into())) },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(db.live_channels(), 0);
    }

    #[test]
    fn test_rows_adapter_skips_undecodable() {
        #[derive(serde::Deserialize)]
        struct Row {
            id: String,
        }
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut callback = rows(move |row: Row| sink.lock().unwrap().push(row.id));
        let event = |new| ChangeEvent {
            table: "t".into(),
            kind: crate::platform::ChangeKind::Insert,
            new,
            old: None,
        };
        callback(event(Some(json!({"id": "a"}))));
        callback(event(Some(json!({"nope": 1}))));
        callback(event(None));
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }
}
