pub mod config;
pub mod db;
pub mod error;
pub mod functions;
pub mod llm;
pub mod platform;
pub mod realtime;
pub mod services;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use config::AppConfig;
use db::Database;
use functions::{ai_chat::AiChatProxy, AI_CHAT};
use llm::ChatKind;
use platform::rest::RestPlatform;
use platform::{Platform, Session};
use services::*;

pub use error::{Error, Result};

/// A backend plus the services that run against it.
#[derive(Clone)]
pub struct WhatsMind {
    platform: Arc<dyn Platform>,
}

impl WhatsMind {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    /// Hosted backend from configuration, with the configured session.
    pub fn connect(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let platform = RestPlatform::new(&config.backend.url, &config.backend.anon_key)?
            .with_heartbeat(Duration::from_secs(config.realtime.heartbeat_secs.max(1)));
        platform.set_session(config.session())?;
        info!(url = %config.backend.url, signed_in = config.session.is_some(), "connected to backend");
        Ok(Self::new(Arc::new(platform)))
    }

    /// Local SQLite backend under `app_dir`, with the AI chat function
    /// proxying to the configured gateway.
    pub fn local(app_dir: &Path, config: &AppConfig) -> Result<(Self, Arc<Database>)> {
        let database = Arc::new(Database::new(app_dir)?);
        database.register_function(AI_CHAT, AiChatProxy::new(config.gateway()))?;
        if let Some(session) = config.session() {
            database.sign_in_as(&session.user_id)?;
        }
        info!(path = %app_dir.display(), "opened local backend");
        Ok((Self::new(database.clone()), database))
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    pub fn session(&self) -> Option<Session> {
        self.platform.session()
    }

    pub fn conversations(&self) -> ConversationService {
        ConversationService::new(self.platform.clone())
    }

    pub fn messages(&self) -> MessageService {
        MessageService::new(self.platform.clone())
    }

    pub fn tasks(&self) -> TaskService {
        TaskService::new(self.platform.clone())
    }

    pub fn categories(&self) -> CategoryService {
        CategoryService::new(self.platform.clone())
    }

    pub fn profiles(&self) -> ProfileService {
        ProfileService::new(self.platform.clone())
    }

    pub fn focus(&self) -> FocusService {
        FocusService::new(self.platform.clone())
    }

    pub fn notifications(&self) -> NotificationService {
        NotificationService::new(self.platform.clone())
    }

    pub fn ai_chat(&self, kind: ChatKind) -> AiChat {
        AiChat::new(self.platform.clone(), kind)
    }
}
