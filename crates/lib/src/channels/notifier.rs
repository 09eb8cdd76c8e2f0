//! Room notifier seam: post a message into a chat room.

use async_trait::async_trait;
use serde::Serialize;

/// Message format marker for plain text (no HTML rendering, URLs still auto-link).
pub const FORMAT_TEXT: &str = "text";

/// Body of a room notification: the text and how the platform should render it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub message_format: String,
}

impl Notification {
    pub fn text(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            message_format: FORMAT_TEXT.to_string(),
        }
    }
}

/// Sends notifications into rooms. Errors are the platform's failure text.
#[async_trait]
pub trait RoomNotifier: Send + Sync {
    async fn notify(&self, room_id: i64, notification: &Notification) -> Result<(), String>;
}
