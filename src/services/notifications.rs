use std::sync::Arc;

use serde_json::json;

use crate::db::models::*;
use crate::error::Result;
use crate::platform::{decode_rows, decode_single, require_session, ChangeKind, ChannelSpec, Platform, Query};
use crate::realtime::{self, Subscription};

pub const PAGE_SIZE: usize = 50;

pub struct NotificationService {
    platform: Arc<dyn Platform>,
}

impl NotificationService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<Notification>> {
        require_session(&*self.platform)?;
        let query = Query::table(NOTIFICATIONS)
            .eq("user_id", user_id)
            .order("created_at", false)
            .limit(limit);
        decode_rows(self.platform.select(&query).await?)
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<usize> {
        require_session(&*self.platform)?;
        self.platform
            .count(
                &Query::table(NOTIFICATIONS)
                    .eq("user_id", user_id)
                    .eq("is_read", false),
            )
            .await
    }

    pub async fn create(
        &self,
        user_id: &str,
        kind: NotificationKind,
        title: &str,
        body: Option<&str>,
    ) -> Result<Notification> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .insert(
                NOTIFICATIONS,
                vec![json!({
                    "user_id": user_id,
                    "type": kind,
                    "title": title,
                    "message": body,
                })],
            )
            .await?;
        decode_single(rows, "inserted notification")
    }

    pub async fn mark_as_read(&self, notification_id: &str) -> Result<Notification> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .update(
                &Query::table(NOTIFICATIONS).eq("id", notification_id),
                json!({ "is_read": true }),
            )
            .await?;
        decode_single(rows, "notification")
    }

    /// Returns how many notifications flipped to read.
    pub async fn mark_all_as_read(&self, user_id: &str) -> Result<usize> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .update(
                &Query::table(NOTIFICATIONS)
                    .eq("user_id", user_id)
                    .eq("is_read", false),
                json!({ "is_read": true }),
            )
            .await?;
        Ok(rows.len())
    }

    pub async fn delete(&self, notification_id: &str) -> Result<()> {
        require_session(&*self.platform)?;
        self.platform
            .delete(&Query::table(NOTIFICATIONS).eq("id", notification_id))
            .await?;
        Ok(())
    }

    /// Delivers each notification created for the user.
    pub async fn subscribe<F>(&self, user_id: &str, on_insert: F) -> Result<Subscription>
    where
        F: FnMut(Notification) + Send + 'static,
    {
        let spec = ChannelSpec::new(format!("notifications:{}", user_id), NOTIFICATIONS)
            .on(ChangeKind::Insert)
            .filter_eq("user_id", user_id);
        realtime::subscribe(&*self.platform, spec, realtime::rows(on_insert)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::signed_in;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_unread_lifecycle() {
        let (_db, platform) = signed_in("me");
        let service = NotificationService::new(platform);
        let first = service
            .create("me", NotificationKind::Task, "Task due", Some("Laundry"))
            .await
            .unwrap();
        service
            .create("me", NotificationKind::Focus, "Session done", None)
            .await
            .unwrap();
        service
            .create("other", NotificationKind::System, "Welcome", None)
            .await
            .unwrap();
        assert_eq!(service.unread_count("me").await.unwrap(), 2);

        let read = service.mark_as_read(&first.id).await.unwrap();
        assert!(read.is_read);
        assert_eq!(service.unread_count("me").await.unwrap(), 1);

        assert_eq!(service.mark_all_as_read("me").await.unwrap(), 1);
        assert_eq!(service.unread_count("me").await.unwrap(), 0);
        assert_eq!(service.unread_count("other").await.unwrap(), 1);

        service.delete(&first.id).await.unwrap();
        let remaining = service.list("me", PAGE_SIZE).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].kind, NotificationKind::Focus);
    }

    #[tokio::test]
    async fn test_subscribe_receives_inserts_only() {
        let (_db, platform) = signed_in("me");
        let service = NotificationService::new(platform);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = service
            .subscribe("me", move |notification| {
                let _ = tx.send(notification);
            })
            .await
            .unwrap();

        let created = service
            .create("me", NotificationKind::Message, "New message", None)
            .await
            .unwrap();
        service.mark_as_read(&created.id).await.unwrap();

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.id, created.id);
        assert!(!delivered.is_read);
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
