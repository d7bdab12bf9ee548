//! Domain services over a [`Platform`](crate::platform::Platform): one remote
//! call per operation, errors propagated unchanged, typed records out.

pub mod ai_chat;
pub mod conversations;
pub mod focus;
pub mod messages;
pub mod notifications;
pub mod profiles;
pub mod tasks;

pub use ai_chat::AiChat;
pub use conversations::ConversationService;
pub use focus::FocusService;
pub use messages::{MessageService, MessageTimeline};
pub use notifications::NotificationService;
pub use profiles::ProfileService;
pub use tasks::{CategoryService, TaskService};
