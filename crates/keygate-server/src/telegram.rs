//! Telegram Bot API adapter: outbound calls for [`ChatGateway`] plus the
//! `getUpdates` long poll that feeds inbound events.

use std::time::Duration;

use async_trait::async_trait;
use keygate_contracts::{ChatId, Command, InboundEvent, Keyboard, MessageRef, Requester};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::gateway::{ChatGateway, GatewayError};

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<TgMessage>,
    pub callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    pub first_name: String,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub from: Option<TgUser>,
    pub chat: TgChat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgCallbackQuery {
    pub id: String,
    pub from: TgUser,
    pub message: Option<TgMessage>,
    pub data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    error_code: Option<i64>,
}

impl From<TgUser> for Requester {
    fn from(user: TgUser) -> Self {
        let display_name = match user.last_name {
            Some(last) if !last.is_empty() => format!("{} {}", user.first_name, last),
            _ => user.first_name,
        };
        Requester {
            id: ChatId(user.id),
            display_name,
            handle: user.username,
        }
    }
}

/// Maps an update to an inbound event; updates the bot does not handle map to `None`.
/// `bot_handle` decides whether `/cmd@handle` is addressed to this bot.
pub fn event_from_update(update: Update, bot_handle: Option<&str>) -> Option<InboundEvent> {
    if let Some(query) = update.callback_query {
        let message = query.message.map(|m| MessageRef {
            chat: ChatId(m.chat.id),
            message_id: m.message_id,
        });
        return Some(InboundEvent::ButtonPress {
            from: query.from.into(),
            callback_id: query.id,
            token: query.data.unwrap_or_default(),
            message,
        });
    }

    let message = update.message?;
    let from = message.from.filter(|u| !u.is_bot)?;
    let text = message.text?;
    let chat = ChatId(message.chat.id);
    Some(match Command::parse(&text, bot_handle) {
        Some(command) => InboundEvent::Command {
            from: from.into(),
            chat,
            command,
        },
        None => InboundEvent::Text {
            from: from.into(),
            chat,
        },
    })
}

pub fn keyboard_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Value> = keyboard
        .iter()
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|b| json!({"text": b.label, "callback_data": b.token.encode()}))
                    .collect(),
            )
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

pub struct TelegramGateway {
    client: Client,
    base: String,
    request_timeout: Duration,
    poll_timeout: Duration,
}

impl TelegramGateway {
    pub fn new(
        api_base: &str,
        token: &str,
        request_timeout: Duration,
        poll_timeout: Duration,
    ) -> Result<Self, String> {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| e.to_string())?;
        Ok(Self {
            client,
            base: format!("{}/bot{}", api_base.trim_end_matches('/'), token),
            request_timeout,
            poll_timeout,
        })
    }

    /// Long-polls for updates after `offset`.
    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, GatewayError> {
        let body = json!({
            "offset": offset,
            "timeout": self.poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        let response = self
            .client
            .post(self.url("getUpdates"))
            .timeout(self.poll_timeout + self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        decode(response, None).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        chat: Option<ChatId>,
    ) -> Result<T, GatewayError> {
        let response = self
            .client
            .post(self.url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        decode(response, chat).await
    }

    fn url(&self, method: &str) -> String {
        format!("{}/{}", self.base, method)
    }

    fn transport_error(&self, e: reqwest::Error) -> GatewayError {
        if e.is_timeout() {
            GatewayError::Timeout(self.request_timeout)
        } else {
            // Strip the URL so the token never reaches the logs.
            GatewayError::Transport(e.without_url().to_string())
        }
    }
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    chat: Option<ChatId>,
) -> Result<T, GatewayError> {
    let status = i64::from(response.status().as_u16());
    let envelope: ApiResponse<T> = response
        .json()
        .await
        .map_err(|e| GatewayError::Transport(format!("decode failed: {}", e.without_url())))?;
    if envelope.ok {
        return envelope.result.ok_or_else(|| GatewayError::Api {
            code: status,
            description: "response carried no result".to_string(),
        });
    }
    Err(classify(
        envelope.error_code.unwrap_or(status),
        envelope.description.unwrap_or_default(),
        chat,
    ))
}

/// 403 means the bot was blocked or never started; "chat not found" means the
/// user never opened a private chat.
pub fn classify(code: i64, description: String, chat: Option<ChatId>) -> GatewayError {
    match chat {
        Some(chat) if code == 403 || description.to_lowercase().contains("chat not found") => {
            GatewayError::Unreachable {
                chat,
                reason: description,
            }
        }
        _ => GatewayError::Api { code, description },
    }
}

#[async_trait]
impl ChatGateway for TelegramGateway {
    async fn probe_channel(&self, chat: ChatId) -> Result<(), GatewayError> {
        let body = json!({"chat_id": chat.0, "action": "typing"});
        self.call::<bool>("sendChatAction", &body, Some(chat))
            .await
            .map(|_| ())
    }

    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<&Keyboard>,
    ) -> Result<MessageRef, GatewayError> {
        let mut body = json!({"chat_id": chat.0, "text": text});
        if let Some(keyboard) = keyboard {
            body["reply_markup"] = keyboard_markup(keyboard);
        }
        let message: TgMessage = self.call("sendMessage", &body, Some(chat)).await?;
        Ok(MessageRef {
            chat: ChatId(message.chat.id),
            message_id: message.message_id,
        })
    }

    async fn send_document(
        &self,
        chat: ChatId,
        file_name: &str,
        content: Vec<u8>,
        caption: &str,
    ) -> Result<(), GatewayError> {
        let form = Form::new()
            .text("chat_id", chat.0.to_string())
            .text("caption", caption.to_string())
            .part(
                "document",
                Part::bytes(content).file_name(file_name.to_string()),
            );
        let response = self
            .client
            .post(self.url("sendDocument"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        decode::<TgMessage>(response, Some(chat)).await.map(|_| ())
    }

    async fn edit_message(&self, message: &MessageRef, text: &str) -> Result<(), GatewayError> {
        let body = json!({
            "chat_id": message.chat.0,
            "message_id": message.message_id,
            "text": text,
        });
        // Result is either the edited message or `true`.
        self.call::<Value>("editMessageText", &body, Some(message.chat))
            .await
            .map(|_| ())
    }

    async fn answer_button(&self, callback_id: &str) -> Result<(), GatewayError> {
        let body = json!({"callback_query_id": callback_id});
        self.call::<bool>("answerCallbackQuery", &body, None)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keygate_contracts::{ActionToken, Button, DecisionAction};

    fn update(value: Value) -> Update {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn command_message_becomes_command_event() {
        let event = event_from_update(update(json!({
            "update_id": 10,
            "message": {
                "message_id": 3,
                "from": {"id": 42, "is_bot": false, "first_name": "Ann", "last_name": "Lee", "username": "ann"},
                "chat": {"id": 42, "type": "private"},
                "text": "/get_config"
            }
        })), None)
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::Command {
                from: Requester::new(42, "Ann Lee").with_handle("ann"),
                chat: ChatId(42),
                command: Command::GetConfig,
            }
        );
    }

    #[test]
    fn plain_text_becomes_text_event() {
        let event = event_from_update(update(json!({
            "update_id": 11,
            "message": {
                "message_id": 4,
                "from": {"id": 42, "first_name": "Ann"},
                "chat": {"id": 42},
                "text": "hello"
            }
        })), None)
        .unwrap();
        assert!(matches!(event, InboundEvent::Text { chat: ChatId(42), .. }));
    }

    #[test]
    fn callback_query_becomes_button_press() {
        let event = event_from_update(update(json!({
            "update_id": 12,
            "callback_query": {
                "id": "cb-1",
                "from": {"id": 1001, "first_name": "Admin"},
                "message": {"message_id": 77, "chat": {"id": 1001}},
                "data": "approve_42"
            }
        })), None)
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::ButtonPress {
                from: Requester::new(1001, "Admin"),
                callback_id: "cb-1".to_string(),
                token: "approve_42".to_string(),
                message: Some(MessageRef {
                    chat: ChatId(1001),
                    message_id: 77
                }),
            }
        );
    }

    #[test]
    fn bot_authors_and_non_text_updates_are_dropped() {
        assert!(event_from_update(update(json!({
            "update_id": 13,
            "message": {
                "message_id": 5,
                "from": {"id": 9, "is_bot": true, "first_name": "Other"},
                "chat": {"id": 9},
                "text": "/start"
            }
        })), None)
        .is_none());
        assert!(event_from_update(update(json!({
            "update_id": 14,
            "message": {"message_id": 6, "from": {"id": 9, "first_name": "X"}, "chat": {"id": 9}}
        })), None)
        .is_none());
    }

    #[test]
    fn group_command_for_another_bot_is_ignored() {
        let event = event_from_update(
            update(json!({
                "update_id": 15,
                "message": {
                    "message_id": 7,
                    "from": {"id": 42, "first_name": "Ann"},
                    "chat": {"id": -100},
                    "text": "/start@someotherbot"
                }
            })),
            Some("keygate_bot"),
        )
        .unwrap();
        assert!(matches!(
            event,
            InboundEvent::Command { command: Command::Other(ref name), .. } if name == "start@someotherbot"
        ));
    }

    #[test]
    fn keyboard_markup_uses_encoded_tokens() {
        let keyboard = vec![vec![
            Button::new("ok", ActionToken::decision(DecisionAction::Approve, ChatId(5))),
            Button::new("no", ActionToken::decision(DecisionAction::Reject, ChatId(5))),
        ]];
        assert_eq!(
            keyboard_markup(&keyboard),
            json!({"inline_keyboard": [[
                {"text": "ok", "callback_data": "approve_5"},
                {"text": "no", "callback_data": "reject_5"}
            ]]})
        );
    }

    #[test]
    fn blocked_and_unknown_chats_are_unreachable() {
        assert!(matches!(
            classify(403, "Forbidden: bot was blocked by the user".into(), Some(ChatId(1))),
            GatewayError::Unreachable { .. }
        ));
        assert!(matches!(
            classify(400, "Bad Request: chat not found".into(), Some(ChatId(1))),
            GatewayError::Unreachable { .. }
        ));
        assert!(matches!(
            classify(400, "Bad Request: message is not modified".into(), Some(ChatId(1))),
            GatewayError::Api { code: 400, .. }
        ));
        assert!(matches!(
            classify(403, "Forbidden".into(), None),
            GatewayError::Api { code: 403, .. }
        ));
    }
}
