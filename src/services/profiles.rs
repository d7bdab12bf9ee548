use std::sync::Arc;

use crate::db::models::*;
use crate::error::Result;
use crate::platform::{decode_rows, decode_single, require_session, to_row, Platform, Query};

pub struct ProfileService {
    platform: Arc<dyn Platform>,
}

impl ProfileService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// `None` when the user has no profile row yet.
    pub async fn get(&self, user_id: &str) -> Result<Option<Profile>> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .select(&Query::table(PROFILES).eq("user_id", user_id).limit(1))
            .await?;
        let profiles: Vec<Profile> = decode_rows(rows)?;
        Ok(profiles.into_iter().next())
    }

    pub async fn update(&self, user_id: &str, update: &ProfileUpdate) -> Result<Profile> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .update(
                &Query::table(PROFILES).eq("user_id", user_id),
                to_row(update, &[])?,
            )
            .await?;
        decode_single(rows, "profile")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::services::testing::signed_in;
    use serde_json::json;

    #[tokio::test]
    async fn test_missing_profile_is_none() {
        let (_db, platform) = signed_in("me");
        let service = ProfileService::new(platform);
        assert!(service.get("me").await.unwrap().is_none());
        assert!(matches!(
            service.update("me", &ProfileUpdate::default()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_keeps_untouched_fields() {
        let (db, platform) = signed_in("me");
        db.insert(
            PROFILES,
            vec![json!({"user_id": "me", "display_name": "Robin", "bio": "hi"})],
        )
        .await
        .unwrap();
        let service = ProfileService::new(platform);

        let updated = service
            .update(
                "me",
                &ProfileUpdate {
                    bio: Some("focus first".into()),
                    app_preferences: Some(json!({"theme": "dark"})),
                    ..ProfileUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.display_name.as_deref(), Some("Robin"));
        assert_eq!(updated.bio.as_deref(), Some("focus first"));
        assert_eq!(updated.app_preferences["theme"], "dark");
        assert_eq!(service.get("me").await.unwrap(), Some(updated));
    }
}
