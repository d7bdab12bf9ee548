use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use crate::db::models::*;
use crate::error::Result;
use crate::platform::{decode_rows, decode_single, require_session, to_row, ChannelSpec, Platform, Query, Session};
use crate::realtime::{self, Subscription};

pub struct ConversationService {
    platform: Arc<dyn Platform>,
}

impl ConversationService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    fn session(&self) -> Result<Session> {
        require_session(&*self.platform)
    }

    /// The user's memberships, most recently joined first, each with its
    /// conversation.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<ConversationEntry>> {
        self.session()?;
        let memberships: Vec<UserConversation> = decode_rows(
            self.platform
                .select(
                    &Query::table(USER_CONVERSATIONS)
                        .eq("user_id", user_id)
                        .order("joined_at", false),
                )
                .await?,
        )?;
        if memberships.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = memberships.iter().map(|m| m.conversation_id.as_str()).collect();
        let conversations: Vec<Conversation> = decode_rows(
            self.platform
                .select(&Query::table(CONVERSATIONS).is_in("id", ids))
                .await?,
        )?;
        let mut by_id: HashMap<String, Conversation> = conversations
            .into_iter()
            .map(|conversation| (conversation.id.clone(), conversation))
            .collect();

        Ok(memberships
            .into_iter()
            .filter_map(|membership| {
                let conversation = by_id.remove(&membership.conversation_id)?;
                Some(ConversationEntry {
                    membership,
                    conversation,
                })
            })
            .collect())
    }

    pub async fn get(&self, conversation_id: &str) -> Result<Conversation> {
        self.session()?;
        let rows = self
            .platform
            .select(&Query::table(CONVERSATIONS).eq("id", conversation_id))
            .await?;
        decode_single(rows, "conversation")
    }

    /// Creates the conversation, then one membership per participant.
    pub async fn create(
        &self,
        name: Option<&str>,
        is_group: bool,
        participant_ids: &[&str],
        category: Option<&str>,
    ) -> Result<Conversation> {
        let session = self.session()?;
        let rows = self
            .platform
            .insert(
                CONVERSATIONS,
                vec![json!({
                    "name": name,
                    "is_group": is_group,
                    "created_by": session.user_id,
                    "category": category.unwrap_or("other"),
                })],
            )
            .await?;
        let conversation: Conversation = decode_single(rows, "inserted conversation")?;

        if !participant_ids.is_empty() {
            let memberships = participant_ids
                .iter()
                .map(|user_id| json!({"user_id": user_id, "conversation_id": conversation.id}))
                .collect();
            self.platform.insert(USER_CONVERSATIONS, memberships).await?;
        }
        debug!(conversation_id = %conversation.id, participants = participant_ids.len(), "created conversation");
        Ok(conversation)
    }

    pub async fn update(&self, conversation_id: &str, update: &ConversationUpdate) -> Result<Conversation> {
        self.session()?;
        let rows = self
            .platform
            .update(
                &Query::table(CONVERSATIONS).eq("id", conversation_id),
                to_row(update, &[])?,
            )
            .await?;
        decode_single(rows, "conversation")
    }

    async fn update_membership(&self, conversation_id: &str, patch: Value) -> Result<UserConversation> {
        let session = self.session()?;
        let rows = self
            .platform
            .update(
                &Query::table(USER_CONVERSATIONS)
                    .eq("conversation_id", conversation_id)
                    .eq("user_id", session.user_id.as_str()),
                patch,
            )
            .await?;
        decode_single(rows, "membership")
    }

    pub async fn pin(&self, conversation_id: &str, pinned: bool) -> Result<UserConversation> {
        self.update_membership(conversation_id, json!({ "is_pinned": pinned }))
            .await
    }

    /// Moves the read marker to the newest message's own `created_at`, so
    /// it only ever compares backend timestamps with each other. An empty
    /// conversation keeps its marker.
    pub async fn mark_as_read(&self, conversation_id: &str) -> Result<UserConversation> {
        let session = self.session()?;
        let newest: Vec<Message> = decode_rows(
            self.platform
                .select(
                    &Query::table(MESSAGES)
                        .eq("conversation_id", conversation_id)
                        .order("created_at", false)
                        .limit(1),
                )
                .await?,
        )?;
        match newest.into_iter().next() {
            Some(message) => {
                self.update_membership(conversation_id, json!({ "last_read_at": message.created_at }))
                    .await
            }
            None => self.membership(&session, conversation_id).await,
        }
    }

    async fn membership(&self, session: &Session, conversation_id: &str) -> Result<UserConversation> {
        let rows = self
            .platform
            .select(
                &Query::table(USER_CONVERSATIONS)
                    .eq("conversation_id", conversation_id)
                    .eq("user_id", session.user_id.as_str()),
            )
            .await?;
        decode_single(rows, "membership")
    }

    pub async fn mark_as_unread(&self, conversation_id: &str) -> Result<UserConversation> {
        self.update_membership(conversation_id, json!({ "last_read_at": null }))
            .await
    }

    /// Messages from other senders newer than the caller's read marker; all
    /// of them when the conversation was never read.
    pub async fn unread_count(&self, conversation_id: &str) -> Result<usize> {
        let session = self.session()?;
        let membership = self.membership(&session, conversation_id).await?;

        let mut query = Query::table(MESSAGES)
            .eq("conversation_id", conversation_id)
            .neq("sender_id", session.user_id.as_str());
        if let Some(last_read_at) = membership.last_read_at {
            query = query.gt("created_at", last_read_at);
        }
        self.platform.count(&query).await
    }

    pub async fn leave(&self, conversation_id: &str) -> Result<()> {
        let session = self.session()?;
        self.platform
            .delete(
                &Query::table(USER_CONVERSATIONS)
                    .eq("conversation_id", conversation_id)
                    .eq("user_id", session.user_id.as_str()),
            )
            .await?;
        Ok(())
    }

    /// Returns the id of the direct (non-group) conversation shared with
    /// `other_user_id`, creating it with both memberships when none exists.
    pub async fn find_or_create_direct(&self, other_user_id: &str) -> Result<String> {
        let session = self.session()?;

        let mine: Vec<UserConversation> = decode_rows(
            self.platform
                .select(&Query::table(USER_CONVERSATIONS).eq("user_id", session.user_id.as_str()))
                .await?,
        )?;
        if !mine.is_empty() {
            let ids: Vec<&str> = mine.iter().map(|m| m.conversation_id.as_str()).collect();
            let shared: Vec<UserConversation> = decode_rows(
                self.platform
                    .select(
                        &Query::table(USER_CONVERSATIONS)
                            .eq("user_id", other_user_id)
                            .is_in("conversation_id", ids),
                    )
                    .await?,
            )?;
            if !shared.is_empty() {
                let shared_ids: Vec<&str> = shared.iter().map(|m| m.conversation_id.as_str()).collect();
                let direct: Vec<Conversation> = decode_rows(
                    self.platform
                        .select(
                            &Query::table(CONVERSATIONS)
                                .is_in("id", shared_ids)
                                .eq("is_group", false),
                        )
                        .await?,
                )?;
                let found = mine
                    .iter()
                    .find(|m| direct.iter().any(|c| c.id == m.conversation_id));
                if let Some(membership) = found {
                    return Ok(membership.conversation_id.clone());
                }
            }
        }

        let profiles: Vec<Profile> = decode_rows(
            self.platform
                .select(&Query::table(PROFILES).eq("user_id", other_user_id).limit(1))
                .await?,
        )?;
        let name = profiles
            .into_iter()
            .next()
            .and_then(|profile| {
                profile
                    .display_name
                    .filter(|name| !name.is_empty())
                    .or(profile.username.filter(|name| !name.is_empty()))
            })
            .unwrap_or_else(|| "Chat".to_string());

        let conversation = self
            .create(
                Some(name.as_str()),
                false,
                &[session.user_id.as_str(), other_user_id],
                Some("other"),
            )
            .await?;
        Ok(conversation.id)
    }

    /// Fires `on_change` on any change to the user's memberships.
    pub async fn subscribe<F>(&self, user_id: &str, on_change: F) -> Result<Subscription>
    where
        F: FnMut() + Send + 'static,
    {
        let spec = ChannelSpec::new(format!("user_conversations:{}", user_id), USER_CONVERSATIONS)
            .filter_eq("user_id", user_id);
        realtime::subscribe(&*self.platform, spec, realtime::reload(on_change)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::services::testing::signed_in;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn send_as(db: &crate::db::Database, conversation_id: &str, sender: &str, text: &str) {
        db.insert(
            MESSAGES,
            vec![json!({"conversation_id": conversation_id, "sender_id": sender, "content": text})],
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_create_and_list() {
        let (_db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let first = service.create(Some("Work"), true, &["me", "a"], Some("work")).await.unwrap();
        let second = service.create(Some("Home"), false, &["me", "b"], None).await.unwrap();
        assert_eq!(second.category, "other");
        assert_eq!(first.created_by.as_deref(), Some("me"));

        let entries = service.list_for_user("me").await.unwrap();
        let names: Vec<_> = entries
            .iter()
            .map(|e| e.conversation.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["Home", "Work"]);
    }

    #[tokio::test]
    async fn test_mark_read_then_new_message_is_unread() {
        let (db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let conversation = service.create(None, false, &["me", "sam"], None).await.unwrap();

        send_as(&db, &conversation.id, "sam", "one").await;
        send_as(&db, &conversation.id, "sam", "two").await;
        send_as(&db, &conversation.id, "me", "mine").await;
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 2);

        service.mark_as_read(&conversation.id).await.unwrap();
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 0);

        send_as(&db, &conversation.id, "sam", "three").await;
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 1);

        service.mark_as_unread(&conversation.id).await.unwrap();
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_mark_read_with_backend_clock_behind() {
        let (db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let conversation = service.create(None, false, &["me", "sam"], None).await.unwrap();
        let behind = |minutes| timestamp(chrono::Utc::now() - chrono::Duration::minutes(minutes));
        let row_at = |at: String, text: &str| {
            json!({
                "conversation_id": conversation.id,
                "sender_id": "sam",
                "content": text,
                "created_at": at,
            })
        };

        let membership = service.mark_as_read(&conversation.id).await.unwrap();
        assert!(membership.last_read_at.is_none());

        db.insert(MESSAGES, vec![row_at(behind(2), "earlier")]).await.unwrap();
        let membership = service.mark_as_read(&conversation.id).await.unwrap();
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 0);
        assert!(membership.last_read_at.unwrap() < now());

        db.insert(MESSAGES, vec![row_at(behind(1), "later")]).await.unwrap();
        assert_eq!(service.unread_count(&conversation.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pin_and_leave() {
        let (_db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let conversation = service.create(None, true, &["me", "a"], None).await.unwrap();

        let membership = service.pin(&conversation.id, true).await.unwrap();
        assert!(membership.is_pinned);

        service.leave(&conversation.id).await.unwrap();
        assert!(service.list_for_user("me").await.unwrap().is_empty());
        assert!(matches!(
            service.pin(&conversation.id, false).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_find_or_create_direct_reuses_existing() {
        let (db, platform) = signed_in("me");
        db.insert(PROFILES, vec![json!({"user_id": "sam", "username": "sammy"})])
            .await
            .unwrap();
        let service = ConversationService::new(platform);
        service.create(Some("Group"), true, &["me", "sam"], None).await.unwrap();

        let id = service.find_or_create_direct("sam").await.unwrap();
        let conversation = service.get(&id).await.unwrap();
        assert_eq!(conversation.name.as_deref(), Some("sammy"));
        assert!(!conversation.is_group);

        let again = service.find_or_create_direct("sam").await.unwrap();
        assert_eq!(again, id);
    }

    #[tokio::test]
    async fn test_direct_name_falls_back_to_chat() {
        let (_db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let id = service.find_or_create_direct("ghost").await.unwrap();
        assert_eq!(service.get(&id).await.unwrap().name.as_deref(), Some("Chat"));
    }

    #[tokio::test]
    async fn test_requires_session() {
        let db = Arc::new(crate::db::Database::open_in_memory().unwrap());
        let service = ConversationService::new(db.clone());
        assert!(matches!(
            service.create(None, false, &[], None).await,
            Err(Error::NotAuthenticated)
        ));
        assert_eq!(db.count(&Query::table(CONVERSATIONS)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_fires_on_membership_change() {
        let (_db, platform) = signed_in("me");
        let service = ConversationService::new(platform);
        let changes = Arc::new(AtomicUsize::new(0));
        let counter = changes.clone();
        let subscription = service
            .subscribe("me", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        service.create(None, false, &["me", "x"], None).await.unwrap();
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        subscription.unsubscribe();
    }
}
