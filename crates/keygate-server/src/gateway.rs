use std::time::Duration;

use async_trait::async_trait;
use keygate_contracts::{ChatId, Keyboard, MessageRef};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("chat {chat} is unreachable: {reason}")]
    Unreachable { chat: ChatId, reason: String },
    #[error("chat call timed out after {0:?}")]
    Timeout(Duration),
    #[error("chat transport failed: {0}")]
    Transport(String),
    #[error("chat api error {code}: {description}")]
    Api { code: i64, description: String },
}

/// Outbound operations the allocation core needs from the chat transport.
#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Liveness check; fails when the chat was never opened or the bot is blocked.
    async fn probe_channel(&self, chat: ChatId) -> Result<(), GatewayError>;

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, GatewayError>;

    async fn send_document(
        &self,
        chat: ChatId,
        file_name: &str,
        content: Vec<u8>,
        caption: &str,
    ) -> Result<(), GatewayError>;

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), GatewayError>;

    async fn answer_button(&self, callback_id: &str) -> Result<(), GatewayError>;
}

/// Where the response to an operation goes: a fresh message, or an edit of the
/// message whose button was pressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyTarget {
    Chat(ChatId),
    Edit(MessageRef),
}
