use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Duration, NaiveTime, Utc};
use serde::Serialize;
use serde_json::json;

use crate::db::models::*;
use crate::error::Result;
use crate::platform::{decode_rows, decode_single, require_session, Platform, Query};

pub const HISTORY_LIMIT: usize = 30;
/// Sessions per day that fill the growth vine.
pub const DAILY_SESSION_GOAL: usize = 10;

pub struct FocusService {
    platform: Arc<dyn Platform>,
}

impl FocusService {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub async fn list(&self, user_id: &str, limit: usize) -> Result<Vec<FocusSession>> {
        require_session(&*self.platform)?;
        let query = Query::table(FOCUS_SESSIONS)
            .eq("user_id", user_id)
            .order("completed_at", false)
            .limit(limit);
        decode_rows(self.platform.select(&query).await?)
    }

    async fn completed_since(&self, user_id: &str, since: String) -> Result<Vec<FocusSession>> {
        let query = Query::table(FOCUS_SESSIONS)
            .eq("user_id", user_id)
            .gte("completed_at", since)
            .order("completed_at", true);
        decode_rows(self.platform.select(&query).await?)
    }

    /// Minutes focused since the start of the current UTC day.
    pub async fn today_minutes(&self, user_id: &str) -> Result<i64> {
        require_session(&*self.platform)?;
        let start = Utc::now().date_naive().and_time(NaiveTime::MIN).and_utc();
        let sessions = self.completed_since(user_id, timestamp(start)).await?;
        Ok(sessions.iter().map(|session| session.duration).sum())
    }

    /// Appends a finished session for the caller.
    pub async fn record(&self, duration_minutes: i64, task_id: Option<&str>) -> Result<FocusSession> {
        let session = require_session(&*self.platform)?;
        let rows = self
            .platform
            .insert(
                FOCUS_SESSIONS,
                vec![json!({
                    "user_id": session.user_id,
                    "duration": duration_minutes,
                    "task_id": task_id,
                })],
            )
            .await?;
        decode_single(rows, "inserted focus session")
    }

    /// Minutes per UTC day over the last seven days, oldest day first. Days
    /// without sessions are absent.
    pub async fn weekly_stats(&self, user_id: &str) -> Result<Vec<DailyFocus>> {
        require_session(&*self.platform)?;
        let since = timestamp(Utc::now() - Duration::days(7));
        let sessions = self.completed_since(user_id, since).await?;

        let mut days: BTreeMap<String, i64> = BTreeMap::new();
        for session in &sessions {
            let Some(at) = parse_timestamp(&session.completed_at) else {
                continue;
            };
            *days.entry(at.date_naive().to_string()).or_default() += session.duration;
        }
        Ok(days
            .into_iter()
            .map(|(date, minutes)| DailyFocus { date, minutes })
            .collect())
    }
}

/// Share of the daily goal reached, as a percentage capped at 100.
pub fn daily_growth(sessions: usize, goal: usize) -> u8 {
    if goal == 0 {
        return 100;
    }
    (sessions.saturating_mul(100) / goal).min(100) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GrowthStage {
    Seed,
    Sprout,
    Growing,
    Blooming,
}

impl GrowthStage {
    pub fn from_percentage(percentage: u8) -> Self {
        match percentage {
            0..=24 => GrowthStage::Seed,
            25..=49 => GrowthStage::Sprout,
            50..=74 => GrowthStage::Growing,
            _ => GrowthStage::Blooming,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::signed_in;

    #[tokio::test]
    async fn test_record_and_today_minutes() {
        let (_db, platform) = signed_in("me");
        let service = FocusService::new(platform);
        service.record(25, None).await.unwrap();
        let second = service.record(15, Some("task-1")).await.unwrap();
        assert_eq!(second.task_id.as_deref(), Some("task-1"));

        assert_eq!(service.today_minutes("me").await.unwrap(), 40);
        let history = service.list("me", HISTORY_LIMIT).await.unwrap();
        assert_eq!(history[0].duration, 15);
    }

    #[tokio::test]
    async fn test_weekly_stats_groups_by_day() {
        let (db, platform) = signed_in("me");
        let at = |days: i64| timestamp(Utc::now() - Duration::days(days));
        let rows = vec![
            json!({"user_id": "me", "duration": 10, "completed_at": at(2)}),
            json!({"user_id": "me", "duration": 20, "completed_at": at(2)}),
            json!({"user_id": "me", "duration": 5, "completed_at": at(0)}),
            json!({"user_id": "me", "duration": 99, "completed_at": at(30)}),
            json!({"user_id": "other", "duration": 7, "completed_at": at(0)}),
        ];
        db.insert(FOCUS_SESSIONS, rows).await.unwrap();

        let stats = FocusService::new(platform).weekly_stats("me").await.unwrap();
        let minutes: Vec<i64> = stats.iter().map(|day| day.minutes).collect();
        assert_eq!(minutes, vec![30, 5]);
        assert!(stats[0].date < stats[1].date);
    }

    #[test]
    fn test_daily_growth_is_clamped() {
        assert_eq!(daily_growth(0, DAILY_SESSION_GOAL), 0);
        assert_eq!(daily_growth(4, DAILY_SESSION_GOAL), 40);
        assert_eq!(daily_growth(14, DAILY_SESSION_GOAL), 100);
        assert_eq!(daily_growth(3, 0), 100);
    }

    #[test]
    fn test_growth_stages() {
        assert_eq!(GrowthStage::from_percentage(0), GrowthStage::Seed);
        assert_eq!(GrowthStage::from_percentage(25), GrowthStage::Sprout);
        assert_eq!(GrowthStage::from_percentage(74), GrowthStage::Growing);
        assert_eq!(GrowthStage::from_percentage(100), GrowthStage::Blooming);
    }
}
