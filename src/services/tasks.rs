use std::sync::Arc;

use chrono::{Duration, NaiveTime, Utc};
use serde_json::json;

use crate::db::models::*;
use crate::error::Result;
use crate::platform::{decode_rows, decode_single, require_session, to_row, ChannelSpec, Platform, Query, Session};
use crate::realtime::{self, Subscription};

pub struct TaskService {
    platform: Arc<dyn Platform>,
}

impl TaskService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    fn session(&self) -> Result<Session> {
        require_session(&*self.platform)
    }

    /// Newest first, optionally only open or only completed tasks.
    pub async fn list(&self, user_id: &str, completed: Option<bool>) -> Result<Vec<Task>> {
        self.session()?;
        let mut query = Query::table(TASKS)
            .eq("user_id", user_id)
            .order("created_at", false);
        if let Some(completed) = completed {
            query = query.eq("is_completed", completed);
        }
        decode_rows(self.platform.select(&query).await?)
    }

    /// Open tasks due during the current UTC day, earliest first.
    pub async fn today(&self, user_id: &str) -> Result<Vec<Task>> {
        self.session()?;
        let start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let end = start + Duration::days(1);
        let query = Query::table(TASKS)
            .eq("user_id", user_id)
            .eq("is_completed", false)
            .gte("due_date", timestamp(start))
            .lt("due_date", timestamp(end))
            .order("due_date", true);
        decode_rows(self.platform.select(&query).await?)
    }

    pub async fn get(&self, task_id: &str) -> Result<Task> {
        self.session()?;
        let rows = self
            .platform
            .select(&Query::table(TASKS).eq("id", task_id))
            .await?;
        decode_single(rows, "task")
    }

    pub async fn create(&self, task: &NewTask) -> Result<Task> {
        let session = self.session()?;
        let row = to_row(task, &[("user_id", json!(session.user_id))])?;
        let rows = self.platform.insert(TASKS, vec![row]).await?;
        decode_single(rows, "inserted task")
    }

    pub async fn update(&self, task_id: &str, update: &TaskUpdate) -> Result<Task> {
        self.session()?;
        let rows = self
            .platform
            .update(&Query::table(TASKS).eq("id", task_id), to_row(update, &[])?)
            .await?;
        decode_single(rows, "task")
    }

    pub async fn delete(&self, task_id: &str) -> Result<()> {
        self.session()?;
        self.platform
            .delete(&Query::table(TASKS).eq("id", task_id))
            .await?;
        Ok(())
    }

    /// Flips completion, stamping or clearing `completed_at` with it.
    pub async fn toggle_complete(&self, task_id: &str) -> Result<Task> {
        let task = self.get(task_id).await?;
        let completed = !task.is_completed;
        let completed_at = completed.then(now);
        let rows = self
            .platform
            .update(
                &Query::table(TASKS).eq("id", task_id),
                json!({ "is_completed": completed, "completed_at": completed_at }),
            )
            .await?;
        decode_single(rows, "task")
    }

    /// Fires `on_change` on any change to the user's tasks.
    pub async fn subscribe<F>(&self, user_id: &str, on_change: F) -> Result<Subscription>
    where
        F: FnMut() + Send + 'static,
    {
        let spec = ChannelSpec::new(format!("tasks:{}", user_id), TASKS).filter_eq("user_id", user_id);
        realtime::subscribe(&*self.platform, spec, realtime::reload(on_change)).await
    }
}

pub struct CategoryService {
    platform: Arc<dyn Platform>,
}

impl CategoryService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Category>> {
        require_session(&*self.platform)?;
        let query = Query::table(CATEGORIES)
            .eq("user_id", user_id)
            .order("name", true);
        decode_rows(self.platform.select(&query).await?)
    }

    pub async fn create(&self, name: &str, color: &str) -> Result<Category> {
        let session = require_session(&*self.platform)?;
        let rows = self
            .platform
            .insert(
                CATEGORIES,
                vec![json!({ "user_id": session.user_id, "name": name, "color": color })],
            )
            .await?;
        decode_single(rows, "inserted category")
    }

    pub async fn update(&self, category_id: &str, update: &CategoryUpdate) -> Result<Category> {
        require_session(&*self.platform)?;
        let rows = self
            .platform
            .update(
                &Query::table(CATEGORIES).eq("id", category_id),
                to_row(update, &[])?,
            )
            .await?;
        decode_single(rows, "category")
    }

    pub async fn delete(&self, category_id: &str) -> Result<()> {
        require_session(&*self.platform)?;
        self.platform
            .delete(&Query::table(CATEGORIES).eq("id", category_id))
            .await?;
        Ok(())
    }
}
