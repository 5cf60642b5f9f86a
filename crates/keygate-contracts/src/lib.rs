use serde::{Deserialize, Serialize};
use std::fmt;

/// Callback data carried by the "request config" button.
pub const REQUEST_CONFIG_TOKEN: &str = "request_config";

/// Stable chat identity. Requesters and the administrator share the same id space,
/// and for private chats the chat id equals the user id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ChatId(pub i64);

pub type RequesterId = ChatId;

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// File name of one allocatable credential inside the pool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ResourceId(pub String);

impl ResourceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requester {
    pub id: RequesterId,
    pub display_name: String,
    #[serde(default)]
    pub handle: Option<String>,
}

impl Requester {
    pub fn new(id: i64, display_name: impl Into<String>) -> Self {
        Self {
            id: ChatId(id),
            display_name: display_name.into(),
            handle: None,
        }
    }

    pub fn with_handle(mut self, handle: impl Into<String>) -> Self {
        self.handle = Some(handle.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionAction::Approve => "approve",
            DecisionAction::Reject => "reject",
        }
    }
}

/// Callback payload attached to inline buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionToken {
    RequestConfig,
    Decision {
        action: DecisionAction,
        requester: RequesterId,
    },
}

impl ActionToken {
    pub fn decision(action: DecisionAction, requester: RequesterId) -> Self {
        ActionToken::Decision { action, requester }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw == REQUEST_CONFIG_TOKEN {
            return Some(ActionToken::RequestConfig);
        }
        let (action, id) = raw.split_once('_')?;
        let action = match action {
            "approve" => DecisionAction::Approve,
            "reject" => DecisionAction::Reject,
            _ => return None,
        };
        let requester = id.parse::<i64>().ok().map(ChatId)?;
        Some(ActionToken::Decision { action, requester })
    }

    pub fn encode(&self) -> String {
        match self {
            ActionToken::RequestConfig => REQUEST_CONFIG_TOKEN.to_string(),
            ActionToken::Decision { action, requester } => {
                format!("{}_{}", action.as_str(), requester)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub token: ActionToken,
}

impl Button {
    pub fn new(label: impl Into<String>, token: ActionToken) -> Self {
        Self {
            label: label.into(),
            token,
        }
    }
}

/// Rows of inline buttons.
pub type Keyboard = Vec<Vec<Button>>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat: ChatId,
    pub message_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    GetConfig,
    Other(String),
}

impl Command {
    /// Parses `/name` or `/name@handle`; returns `None` for non-command text.
    ///
    /// With `bot_handle` set, a command addressed to a different bot parses as
    /// `Other` so it is never acted on.
    pub fn parse(text: &str, bot_handle: Option<&str>) -> Option<Self> {
        let head = text.split_whitespace().next()?;
        let body = head.strip_prefix('/')?;
        let (name, target) = match body.split_once('@') {
            Some((name, target)) => (name, Some(target)),
            None => (body, None),
        };
        if let (Some(target), Some(own)) = (target, bot_handle) {
            if !target.eq_ignore_ascii_case(own.trim_start_matches('@')) {
                return Some(Command::Other(body.to_string()));
            }
        }
        Some(match name {
            "start" => Command::Start,
            "get_config" => Command::GetConfig,
            other => Command::Other(other.to_string()),
        })
    }
}

/// Inbound event as delivered by the chat transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Command {
        from: Requester,
        chat: ChatId,
        command: Command,
    },
    ButtonPress {
        from: Requester,
        callback_id: String,
        token: String,
        message: Option<MessageRef>,
    },
    Text {
        from: Requester,
        chat: ChatId,
    },
}
